use crate::secrets;
use crate::store::{
    AccessTokenRecord, AuthorizationCodeRecord, IssuerStore, OAuthClientRecord,
    RefreshTokenRecord, SweepStats,
};
use anyhow::Context as _;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::task::spawn_blocking;

pub const AUTHORIZATION_CODE_TTL: Duration = Duration::minutes(10);
pub const ACCESS_TOKEN_TTL: Duration = Duration::hours(1);
pub const REFRESH_TOKEN_TTL: Duration = Duration::days(30);

pub const DEFAULT_GRANT_TYPES: [&str; 2] = ["authorization_code", "refresh_token"];

/// Issuer-side OAuth 2.1 service: clients, codes, tokens.
#[derive(Clone)]
pub struct OAuthIssuer {
    store: Arc<dyn IssuerStore>,
}

/// Registration result. `client_secret` is the plaintext secret and exists
/// only here; the stored record carries the bcrypt hash.
pub struct RegisteredClient {
    pub record: OAuthClientRecord,
    pub client_secret: Option<String>,
}

impl OAuthIssuer {
    pub fn new(store: Arc<dyn IssuerStore>) -> Self {
        Self { store }
    }

    pub async fn register_client(
        &self,
        client_name: &str,
        redirect_uris: Vec<String>,
        grant_types: Vec<String>,
        scopes: Vec<String>,
        is_confidential: bool,
    ) -> anyhow::Result<RegisteredClient> {
        let client_id = secrets::new_client_id()?;

        let (client_secret, client_secret_hash) = if is_confidential {
            let secret = secrets::new_client_secret()?;
            let to_hash = secret.clone();
            // bcrypt is CPU-bound; keep it off the async workers.
            let hash = spawn_blocking(move || bcrypt::hash(to_hash, bcrypt::DEFAULT_COST))
                .await
                .context("join bcrypt hash task")?
                .context("hash client secret")?;
            (Some(secret), Some(hash))
        } else {
            (None, None)
        };

        let grant_types = if grant_types.is_empty() {
            DEFAULT_GRANT_TYPES.iter().map(ToString::to_string).collect()
        } else {
            grant_types
        };

        let record = OAuthClientRecord {
            client_id,
            client_secret_hash,
            client_name: client_name.to_string(),
            redirect_uris,
            grant_types,
            scopes,
            is_confidential,
            token_endpoint_auth_method: if is_confidential {
                "client_secret_basic".to_string()
            } else {
                "none".to_string()
            },
            user_id: None,
            created_at: Utc::now(),
        };
        self.store.insert_oauth_client(&record).await?;

        Ok(RegisteredClient {
            record,
            client_secret,
        })
    }

    pub async fn get_client(&self, client_id: &str) -> anyhow::Result<Option<OAuthClientRecord>> {
        self.store.get_oauth_client(client_id).await
    }

    /// Validate client id + secret. Public clients skip the secret check.
    pub async fn validate_client_credentials(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> anyhow::Result<OAuthClientRecord> {
        let client = self
            .store
            .get_oauth_client(client_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("client not found"))?;

        if client.is_confidential {
            let hash = client
                .client_secret_hash
                .clone()
                .ok_or_else(|| anyhow::anyhow!("invalid client secret"))?;
            let presented = client_secret.to_string();
            let ok = spawn_blocking(move || bcrypt::verify(presented, &hash).unwrap_or(false))
                .await
                .context("join bcrypt verify task")?;
            if !ok {
                anyhow::bail!("invalid client secret");
            }
        }

        Ok(client)
    }

    /// Exact-string membership check against the registered redirect URIs.
    pub fn validate_redirect_uri(client: &OAuthClientRecord, redirect_uri: &str) -> bool {
        client.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    /// Validate a space-separated scope request against the client's
    /// configured set. An empty configured set accepts anything.
    pub fn validate_scopes(
        client: &OAuthClientRecord,
        requested_scopes: &str,
    ) -> anyhow::Result<String> {
        if client.scopes.is_empty() {
            return Ok(requested_scopes.to_string());
        }

        let mut validated = Vec::new();
        for scope in requested_scopes.split(' ') {
            let scope = scope.trim();
            if scope.is_empty() {
                continue;
            }
            if client.scopes.iter().any(|allowed| allowed == scope) {
                validated.push(scope);
            } else {
                anyhow::bail!("scope not allowed: {scope}");
            }
        }
        Ok(validated.join(" "))
    }

    /// Issue a 10-minute, single-use, S256-bound authorization code.
    pub async fn create_authorization_code(
        &self,
        client_id: &str,
        user_id: i64,
        redirect_uri: &str,
        scope: &str,
        code_challenge: &str,
        code_challenge_method: &str,
    ) -> anyhow::Result<String> {
        if code_challenge_method != secrets::PKCE_METHOD_S256 {
            anyhow::bail!("invalid code_challenge_method: only S256 is supported");
        }

        let code = secrets::new_authorization_code()?;
        let now = Utc::now();
        self.store
            .insert_authorization_code(&AuthorizationCodeRecord {
                code: code.clone(),
                client_id: client_id.to_string(),
                user_id,
                redirect_uri: redirect_uri.to_string(),
                scope: scope.to_string(),
                expires_at: now + AUTHORIZATION_CODE_TTL,
                code_challenge: code_challenge.to_string(),
                code_challenge_method: code_challenge_method.to_string(),
                used: false,
                created_at: now,
            })
            .await?;
        Ok(code)
    }

    pub async fn get_authorization_code(
        &self,
        code: &str,
    ) -> anyhow::Result<Option<AuthorizationCodeRecord>> {
        self.store.get_authorization_code(code).await
    }

    /// Mark the code used. Returns false on replay.
    pub async fn consume_authorization_code(&self, code: &str) -> anyhow::Result<bool> {
        self.store.consume_authorization_code(code).await
    }

    pub async fn issue_access_token(
        &self,
        client_id: &str,
        user_id: Option<i64>,
        scope: &str,
        audience: &str,
        refresh_token_id: Option<i64>,
    ) -> anyhow::Result<AccessTokenRecord> {
        let now = Utc::now();
        let mut record = AccessTokenRecord {
            id: 0,
            access_token: secrets::new_opaque_access_token()?,
            client_id: client_id.to_string(),
            user_id,
            scope: scope.to_string(),
            expires_at: now + ACCESS_TOKEN_TTL,
            refresh_token_id,
            audience: audience.to_string(),
            revoked: false,
            created_at: now,
        };
        record.id = self.store.insert_access_token(&record).await?;
        Ok(record)
    }

    pub async fn issue_refresh_token(
        &self,
        client_id: &str,
        user_id: i64,
        scope: &str,
    ) -> anyhow::Result<RefreshTokenRecord> {
        let now = Utc::now();
        let mut record = RefreshTokenRecord {
            id: 0,
            refresh_token: secrets::new_opaque_access_token()?,
            client_id: client_id.to_string(),
            user_id,
            scope: scope.to_string(),
            expires_at: now + REFRESH_TOKEN_TTL,
            revoked: false,
            rotation_count: 0,
            created_at: now,
        };
        record.id = self.store.insert_refresh_token(&record).await?;
        Ok(record)
    }

    /// Look up an access token, returning it only when usable
    /// (known, unrevoked, unexpired).
    pub async fn validate_access_token(
        &self,
        token: &str,
    ) -> anyhow::Result<Option<AccessTokenRecord>> {
        Ok(self
            .store
            .get_access_token(token)
            .await?
            .filter(AccessTokenRecord::is_valid))
    }

    pub async fn validate_refresh_token(
        &self,
        token: &str,
    ) -> anyhow::Result<Option<RefreshTokenRecord>> {
        Ok(self
            .store
            .get_refresh_token(token)
            .await?
            .filter(RefreshTokenRecord::is_valid))
    }

    pub async fn revoke_access_token(&self, token: &str) -> anyhow::Result<bool> {
        self.store.revoke_access_token(token).await
    }

    pub async fn revoke_refresh_token(&self, token: &str) -> anyhow::Result<bool> {
        self.store.revoke_refresh_token(token).await
    }

    pub async fn increment_refresh_rotation(&self, id: i64) -> anyhow::Result<()> {
        self.store.increment_refresh_rotation(id).await
    }

    /// Expiry sweep: drops expired codes and expired non-revoked tokens.
    pub async fn cleanup_expired(&self) -> anyhow::Result<SweepStats> {
        self.store.delete_expired_credentials(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn issuer() -> OAuthIssuer {
        OAuthIssuer::new(Arc::new(MemoryStore::new()))
    }

    async fn confidential_client(issuer: &OAuthIssuer, scopes: Vec<String>) -> RegisteredClient {
        issuer
            .register_client(
                "Test App",
                vec!["http://x/cb".into()],
                vec![],
                scopes,
                true,
            )
            .await
            .expect("register")
    }

    #[tokio::test]
    async fn registration_stores_hash_and_returns_secret_once() -> anyhow::Result<()> {
        let issuer = issuer();
        let registered = confidential_client(&issuer, vec![]).await;

        let secret = registered.client_secret.clone().expect("secret");
        assert!(!secret.is_empty());

        let stored = issuer
            .get_client(&registered.record.client_id)
            .await?
            .expect("client");
        let hash = stored.client_secret_hash.expect("hash");
        assert_ne!(hash, secret);
        assert!(hash.starts_with("$2"));
        assert_eq!(
            stored.grant_types,
            vec!["authorization_code", "refresh_token"]
        );
        assert_eq!(stored.token_endpoint_auth_method, "client_secret_basic");
        Ok(())
    }

    #[tokio::test]
    async fn public_client_has_no_secret_and_auth_method_none() -> anyhow::Result<()> {
        let issuer = issuer();
        let registered = issuer
            .register_client("Public", vec!["http://x/cb".into()], vec![], vec![], false)
            .await?;
        assert!(registered.client_secret.is_none());
        assert!(registered.record.client_secret_hash.is_none());
        assert_eq!(registered.record.token_endpoint_auth_method, "none");

        // Credential validation skips the secret check for public clients.
        issuer
            .validate_client_credentials(&registered.record.client_id, "")
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn credential_validation_rejects_wrong_secret() -> anyhow::Result<()> {
        let issuer = issuer();
        let registered = confidential_client(&issuer, vec![]).await;
        let client_id = registered.record.client_id.clone();
        let secret = registered.client_secret.expect("secret");

        issuer.validate_client_credentials(&client_id, &secret).await?;

        let err = issuer
            .validate_client_credentials(&client_id, "wrong")
            .await
            .expect_err("wrong secret must fail");
        assert!(err.to_string().contains("invalid client secret"));

        let err = issuer
            .validate_client_credentials("unknown", "whatever")
            .await
            .expect_err("unknown client must fail");
        assert!(err.to_string().contains("client not found"));
        Ok(())
    }

    #[tokio::test]
    async fn scope_validation_semantics() -> anyhow::Result<()> {
        let issuer = issuer();
        let anything = confidential_client(&issuer, vec![]).await.record;
        assert_eq!(
            OAuthIssuer::validate_scopes(&anything, "a b c")?,
            "a b c"
        );

        let restricted = confidential_client(&issuer, vec!["mcp:read".into(), "mcp:call".into()])
            .await
            .record;
        assert_eq!(
            OAuthIssuer::validate_scopes(&restricted, " mcp:read  mcp:call ")?,
            "mcp:read mcp:call"
        );

        let err = OAuthIssuer::validate_scopes(&restricted, "mcp:read mcp:admin")
            .expect_err("unknown scope must fail the request");
        assert_eq!(err.to_string(), "scope not allowed: mcp:admin");
        Ok(())
    }

    #[tokio::test]
    async fn authorization_codes_are_s256_only_with_ten_minute_ttl() -> anyhow::Result<()> {
        let issuer = issuer();

        let err = issuer
            .create_authorization_code("c", 1, "http://x/cb", "", "ch", "plain")
            .await
            .expect_err("plain must be rejected");
        assert!(err.to_string().contains("only S256"));

        let code = issuer
            .create_authorization_code("c", 1, "http://x/cb", "s", "ch", "S256")
            .await?;
        let record = issuer
            .get_authorization_code(&code)
            .await?
            .expect("stored code");
        assert_eq!(record.code_challenge_method, "S256");
        assert_eq!(record.expires_at - record.created_at, AUTHORIZATION_CODE_TTL);
        assert!(record.is_valid());
        Ok(())
    }

    #[tokio::test]
    async fn token_ttls_match_policy() -> anyhow::Result<()> {
        let issuer = issuer();
        let access = issuer
            .issue_access_token("c", Some(1), "s", "http://gw", None)
            .await?;
        assert_eq!(access.expires_at - access.created_at, ACCESS_TOKEN_TTL);
        assert!(!access.access_token.is_empty());

        let refresh = issuer.issue_refresh_token("c", 1, "s").await?;
        assert_eq!(refresh.expires_at - refresh.created_at, REFRESH_TOKEN_TTL);
        assert_eq!(refresh.rotation_count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn validate_access_token_filters_revoked_and_expired() -> anyhow::Result<()> {
        let issuer = issuer();
        let access = issuer
            .issue_access_token("c", None, "s", "http://gw", None)
            .await?;

        assert!(
            issuer
                .validate_access_token(&access.access_token)
                .await?
                .is_some()
        );
        assert!(issuer.validate_access_token("missing").await?.is_none());

        assert!(issuer.revoke_access_token(&access.access_token).await?);
        assert!(
            issuer
                .validate_access_token(&access.access_token)
                .await?
                .is_none()
        );
        // Revocation is idempotent at the store level: second call is a no-op.
        assert!(!issuer.revoke_access_token(&access.access_token).await?);
        Ok(())
    }

    #[tokio::test]
    async fn rotation_counter_increments() -> anyhow::Result<()> {
        let issuer = issuer();
        let refresh = issuer.issue_refresh_token("c", 1, "s").await?;
        issuer.increment_refresh_rotation(refresh.id).await?;
        issuer.increment_refresh_rotation(refresh.id).await?;

        let stored = issuer
            .validate_refresh_token(&refresh.refresh_token)
            .await?
            .expect("refresh token");
        assert_eq!(stored.rotation_count, 2);
        Ok(())
    }
}
