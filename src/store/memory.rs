use async_mutex::Mutex;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::{CredentialStore, StoreError, StoreResult};
use crate::models::{
    LinkTokens, NewOAuthState, NewSession, NewUser, OAuthState, Session, SpotifyLink, User,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    users: BTreeMap<i64, User>,
    sessions: BTreeMap<i64, Session>,
    oauth_states: BTreeMap<i64, OAuthState>,
    links: BTreeMap<i64, SpotifyLink>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store with the same uniqueness and cascade rules as
/// the postgres schema. Used by tests and `DATABASE_URL=memory`.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }

    pub async fn oauth_state_count(&self) -> usize {
        self.tables.lock().await.oauth_states.len()
    }

    /// Force an oauth state's expiration, e.g. to simulate an abandoned link attempt
    pub async fn set_oauth_state_expiration(&self, user_id: i64, expiration: DateTime<Utc>) {
        let mut t = self.tables.lock().await;
        for state in t.oauth_states.values_mut() {
            if state.user_id == user_id {
                state.expiration = expiration;
            }
        }
    }

    /// Force a link's access token expiration
    pub async fn set_link_expiration(&self, user_id: i64, expiration: DateTime<Utc>) {
        let mut t = self.tables.lock().await;
        for link in t.links.values_mut() {
            if link.user_id == user_id {
                link.access_token_expiration = expiration;
            }
        }
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_user(&self, user: NewUser) -> StoreResult<User> {
        let mut t = self.tables.lock().await;
        if t.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::Conflict("users_username_key".into()));
        }
        if t.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("users_email_key".into()));
        }
        let now = Utc::now();
        let id = t.next_id();
        let user = User {
            id,
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            created: now,
            modified: now,
        };
        t.users.insert(id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let t = self.tables.lock().await;
        Ok(t.users.values().find(|u| u.username == username).cloned())
    }

    async fn username_exists(&self, username: &str) -> StoreResult<bool> {
        let t = self.tables.lock().await;
        Ok(t.users.values().any(|u| u.username == username))
    }

    async fn email_exists(&self, email: &str) -> StoreResult<bool> {
        let t = self.tables.lock().await;
        Ok(t.users.values().any(|u| u.email == email))
    }

    async fn delete_user(&self, id: i64) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        if t.users.remove(&id).is_none() {
            return Ok(false);
        }
        t.sessions.retain(|_, s| s.user_id != id);
        t.oauth_states.retain(|_, s| s.user_id != id);
        t.links.retain(|_, l| l.user_id != id);
        Ok(true)
    }

    async fn insert_session(&self, session: NewSession) -> StoreResult<Session> {
        let mut t = self.tables.lock().await;
        if !t.users.contains_key(&session.user_id) {
            return Err(StoreError::Other(format!(
                "session references missing user {}",
                session.user_id
            )));
        }
        if t.sessions.values().any(|s| {
            s.token_hash == session.token_hash || s.csrf_token == session.csrf_token
        }) {
            return Err(StoreError::Conflict("sessions_token_key".into()));
        }
        let id = t.next_id();
        let session = Session {
            id,
            user_id: session.user_id,
            token_hash: session.token_hash,
            csrf_token: session.csrf_token,
            expiration: session.expiration,
            created: Utc::now(),
        };
        t.sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        let t = self.tables.lock().await;
        Ok(t.sessions
            .values()
            .find(|s| s.token_hash == token_hash)
            .cloned())
    }

    async fn update_session_expiration(
        &self,
        id: i64,
        expiration: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        match t.sessions.get_mut(&id) {
            Some(s) => {
                s.expiration = expiration;
                Ok(())
            }
            None => Err(StoreError::Other(format!("session {} no longer exists", id))),
        }
    }

    async fn delete_session(&self, id: i64) -> StoreResult<bool> {
        Ok(self.tables.lock().await.sessions.remove(&id).is_some())
    }

    async fn delete_sessions_expired_before(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let before = t.sessions.len();
        t.sessions.retain(|_, s| s.expiration >= now);
        Ok((before - t.sessions.len()) as u64)
    }

    async fn delete_oauth_states_for_user(&self, user_id: i64) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let before = t.oauth_states.len();
        t.oauth_states.retain(|_, s| s.user_id != user_id);
        Ok((before - t.oauth_states.len()) as u64)
    }

    async fn insert_oauth_state(&self, state: NewOAuthState) -> StoreResult<OAuthState> {
        let mut t = self.tables.lock().await;
        if t.oauth_states.values().any(|s| s.user_id == state.user_id) {
            return Err(StoreError::Conflict("oauth_states_user_id_key".into()));
        }
        let id = t.next_id();
        let state = OAuthState {
            id,
            user_id: state.user_id,
            state: state.state,
            expiration: state.expiration,
            created: Utc::now(),
        };
        t.oauth_states.insert(id, state.clone());
        Ok(state)
    }

    async fn find_oauth_state_for_user(&self, user_id: i64) -> StoreResult<Option<OAuthState>> {
        let t = self.tables.lock().await;
        Ok(t.oauth_states
            .values()
            .find(|s| s.user_id == user_id)
            .cloned())
    }

    async fn delete_oauth_state(&self, id: i64) -> StoreResult<bool> {
        Ok(self.tables.lock().await.oauth_states.remove(&id).is_some())
    }

    async fn delete_oauth_states_expired_before(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut t = self.tables.lock().await;
        let before = t.oauth_states.len();
        t.oauth_states.retain(|_, s| s.expiration >= now);
        Ok((before - t.oauth_states.len()) as u64)
    }

    async fn find_link_for_user(&self, user_id: i64) -> StoreResult<Option<SpotifyLink>> {
        let t = self.tables.lock().await;
        Ok(t.links.values().find(|l| l.user_id == user_id).cloned())
    }

    async fn upsert_link(&self, user_id: i64, tokens: LinkTokens) -> StoreResult<SpotifyLink> {
        let mut t = self.tables.lock().await;
        if !t.users.contains_key(&user_id) {
            return Err(StoreError::Other(format!(
                "link references missing user {}",
                user_id
            )));
        }
        let now = Utc::now();
        let existing = t
            .links
            .values()
            .find(|l| l.user_id == user_id)
            .map(|l| (l.id, l.created));
        let (id, created) = match existing {
            Some(found) => found,
            None => (t.next_id(), now),
        };
        let link = SpotifyLink {
            id,
            user_id,
            access_token: tokens.access_token,
            access_nonce: tokens.access_nonce,
            refresh_token: tokens.refresh_token,
            refresh_nonce: tokens.refresh_nonce,
            access_token_expiration: tokens.access_token_expiration,
            created,
            modified: now,
        };
        t.links.insert(id, link.clone());
        Ok(link)
    }

    async fn update_link_tokens(&self, id: i64, tokens: LinkTokens) -> StoreResult<SpotifyLink> {
        let mut t = self.tables.lock().await;
        let link = t
            .links
            .get_mut(&id)
            .ok_or_else(|| StoreError::Other(format!("spotify link {} no longer exists", id)))?;
        link.access_token = tokens.access_token;
        link.access_nonce = tokens.access_nonce;
        link.refresh_token = tokens.refresh_token;
        link.refresh_nonce = tokens.refresh_nonce;
        link.access_token_expiration = tokens.access_token_expiration;
        link.modified = Utc::now();
        Ok(link.clone())
    }

    async fn delete_link(&self, id: i64) -> StoreResult<bool> {
        Ok(self.tables.lock().await.links.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_user(name: &str) -> NewUser {
        NewUser {
            username: name.to_string(),
            email: format!("{}@x.com", name),
            password_hash: "hash".to_string(),
        }
    }

    #[async_std::test]
    async fn usernames_and_emails_are_unique() {
        let store = MemoryStore::new();
        store.insert_user(new_user("alice")).await.unwrap();
        let dup = store.insert_user(new_user("alice")).await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));
    }

    #[async_std::test]
    async fn deleting_a_user_cascades() {
        let store = MemoryStore::new();
        let user = store.insert_user(new_user("alice")).await.unwrap();
        let expiration = Utc::now() + Duration::days(1);
        store
            .insert_session(NewSession {
                user_id: user.id,
                token_hash: "t".into(),
                csrf_token: "c".into(),
                expiration,
            })
            .await
            .unwrap();
        store
            .insert_oauth_state(NewOAuthState {
                user_id: user.id,
                state: "s".into(),
                expiration,
            })
            .await
            .unwrap();
        store
            .upsert_link(
                user.id,
                LinkTokens {
                    access_token: "a".into(),
                    access_nonce: "n".into(),
                    refresh_token: "r".into(),
                    refresh_nonce: "n".into(),
                    access_token_expiration: expiration,
                },
            )
            .await
            .unwrap();

        assert!(store.delete_user(user.id).await.unwrap());
        assert_eq!(store.session_count().await, 0);
        assert_eq!(store.oauth_state_count().await, 0);
        assert!(store.find_link_for_user(user.id).await.unwrap().is_none());
    }

    #[async_std::test]
    async fn one_oauth_state_per_user() {
        let store = MemoryStore::new();
        let user = store.insert_user(new_user("alice")).await.unwrap();
        let state = || NewOAuthState {
            user_id: user.id,
            state: "s".into(),
            expiration: Utc::now(),
        };
        store.insert_oauth_state(state()).await.unwrap();
        assert!(matches!(
            store.insert_oauth_state(state()).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
