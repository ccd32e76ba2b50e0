use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{CredentialStore, StoreError, StoreResult};
use crate::models::{
    LinkTokens, NewOAuthState, NewSession, NewUser, OAuthState, Session, SpotifyLink, User,
};

const UNIQUE_VIOLATION: &str = "23505";

fn map_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Database(e)
}

/// Postgres backed store. Tables live in the `groove` schema,
/// see `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialStore for PgStore {
    async fn insert_user(&self, user: NewUser) -> StoreResult<User> {
        sqlx::query_as::<_, User>(
            "
            insert into groove.users (username, email, password_hash)
            values ($1, $2, $3)
            returning *
            ",
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn find_user(&self, id: i64) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, User>("select * from groove.users where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, User>("select * from groove.users where username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn username_exists(&self, username: &str) -> StoreResult<bool> {
        let count: i64 =
            sqlx::query_scalar("select count(*) from groove.users where username = $1")
                .bind(username)
                .fetch_one(&self.pool)
                .await
                .map_err(map_err)?;
        Ok(count > 0)
    }

    async fn email_exists(&self, email: &str) -> StoreResult<bool> {
        let count: i64 = sqlx::query_scalar("select count(*) from groove.users where email = $1")
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(count > 0)
    }

    async fn delete_user(&self, id: i64) -> StoreResult<bool> {
        // sessions, oauth_states and spotify_links cascade via fk
        let res = sqlx::query("delete from groove.users where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_session(&self, session: NewSession) -> StoreResult<Session> {
        sqlx::query_as::<_, Session>(
            "
            insert into groove.sessions (user_id, token_hash, csrf_token, expiration)
            values ($1, $2, $3, $4)
            returning *
            ",
        )
        .bind(session.user_id)
        .bind(&session.token_hash)
        .bind(&session.csrf_token)
        .bind(session.expiration)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        sqlx::query_as::<_, Session>("select * from groove.sessions where token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn update_session_expiration(
        &self,
        id: i64,
        expiration: DateTime<Utc>,
    ) -> StoreResult<()> {
        let res = sqlx::query("update groove.sessions set expiration = $1 where id = $2")
            .bind(expiration)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Other(format!("session {} no longer exists", id)));
        }
        Ok(())
    }

    async fn delete_session(&self, id: i64) -> StoreResult<bool> {
        let res = sqlx::query("delete from groove.sessions where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_sessions_expired_before(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let res = sqlx::query("delete from groove.sessions where expiration < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }

    async fn delete_oauth_states_for_user(&self, user_id: i64) -> StoreResult<u64> {
        let res = sqlx::query("delete from groove.oauth_states where user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }

    async fn insert_oauth_state(&self, state: NewOAuthState) -> StoreResult<OAuthState> {
        sqlx::query_as::<_, OAuthState>(
            "
            insert into groove.oauth_states (user_id, state, expiration)
            values ($1, $2, $3)
            returning *
            ",
        )
        .bind(state.user_id)
        .bind(&state.state)
        .bind(state.expiration)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn find_oauth_state_for_user(&self, user_id: i64) -> StoreResult<Option<OAuthState>> {
        sqlx::query_as::<_, OAuthState>("select * from groove.oauth_states where user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn delete_oauth_state(&self, id: i64) -> StoreResult<bool> {
        let res = sqlx::query("delete from groove.oauth_states where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_oauth_states_expired_before(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let res = sqlx::query("delete from groove.oauth_states where expiration < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }

    async fn find_link_for_user(&self, user_id: i64) -> StoreResult<Option<SpotifyLink>> {
        sqlx::query_as::<_, SpotifyLink>("select * from groove.spotify_links where user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn upsert_link(&self, user_id: i64, tokens: LinkTokens) -> StoreResult<SpotifyLink> {
        sqlx::query_as::<_, SpotifyLink>(
            "
            insert into
            groove.spotify_links (
                user_id,
                access_token, access_nonce,
                refresh_token, refresh_nonce,
                access_token_expiration
            )
            values ($1, $2, $3, $4, $5, $6)
            on conflict (user_id) do update set
            access_token = excluded.access_token, access_nonce = excluded.access_nonce,
            refresh_token = excluded.refresh_token, refresh_nonce = excluded.refresh_nonce,
            access_token_expiration = excluded.access_token_expiration,
            modified = now()
            returning *
            ",
        )
        .bind(user_id)
        .bind(&tokens.access_token)
        .bind(&tokens.access_nonce)
        .bind(&tokens.refresh_token)
        .bind(&tokens.refresh_nonce)
        .bind(tokens.access_token_expiration)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn update_link_tokens(&self, id: i64, tokens: LinkTokens) -> StoreResult<SpotifyLink> {
        sqlx::query_as::<_, SpotifyLink>(
            "
            update groove.spotify_links set
            access_token = $1, access_nonce = $2,
            refresh_token = $3, refresh_nonce = $4,
            access_token_expiration = $5,
            modified = now()
            where id = $6
            returning *
            ",
        )
        .bind(&tokens.access_token)
        .bind(&tokens.access_nonce)
        .bind(&tokens.refresh_token)
        .bind(&tokens.refresh_nonce)
        .bind(tokens.access_token_expiration)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn delete_link(&self, id: i64) -> StoreResult<bool> {
        let res = sqlx::query("delete from groove.spotify_links where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected() > 0)
    }
}
