//! An [`AuthApi`] talking to a GoTrue server over HTTP

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{
    dto::{self, PkceGrant, RefreshTokenGrant, TokenResponse},
    AuthApi, PasswordCredentials, SignOutScope, UserAttributes,
};
use crate::{
    jwt::Jwks, AccessTokenRef, AuthCodeRef, AuthError, CodeVerifierRef, RefreshTokenRef, Session,
    User,
};

/// An HTTP client for the auth server
#[derive(Clone)]
pub struct HttpAuthApi {
    client: reqwest::Client,
    url: reqwest::Url,
    api_key: String,
}

impl std::fmt::Debug for HttpAuthApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAuthApi")
            .field("url", &self.url.as_str())
            .field("api_key", &"***API KEY***")
            .finish()
    }
}

impl HttpAuthApi {
    /// Constructs a client for the server at `url` (for example
    /// `https://<project>.supabase.co/auth/v1/`)
    pub fn new(client: reqwest::Client, url: reqwest::Url, api_key: impl Into<String>) -> Self {
        Self {
            client,
            url,
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<reqwest::Url, AuthError> {
        let mut base = self.url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(path).map_err(|err| AuthError::Api {
            status: 0,
            code: None,
            message: err.to_string(),
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        jwt: Option<&AccessTokenRef>,
    ) -> Result<reqwest::RequestBuilder, AuthError> {
        let bearer = jwt.map_or(self.api_key.as_str(), AccessTokenRef::as_str);
        Ok(self
            .client
            .request(method, self.endpoint(path)?)
            .header("apikey", &self.api_key)
            .bearer_auth(bearer))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<String, AuthError> {
        let resp = req.send().await.map_err(|err| AuthError::RetryableTransport {
            status: None,
            message: err.to_string(),
        })?;

        let status = resp.status().as_u16();
        tracing::debug!(response.status = status, "received response from auth server");

        let body = resp
            .text()
            .await
            .map_err(|err| AuthError::RetryableTransport {
                status: Some(status),
                message: err.to_string(),
            })?;

        if (200..300).contains(&status) {
            Ok(body)
        } else {
            Err(dto::classify_error_response(status, &body))
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, AuthError> {
        let body = self.send(req).await?;
        serde_json::from_str(&body).map_err(|err| {
            tracing::warn!(error = (&err as &dyn std::error::Error), "unable to decode response");
            AuthError::InvalidTokenResponse
        })
    }

    async fn token_grant<B: serde::Serialize + Sync>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> Result<Session, AuthError> {
        let req = self
            .request(reqwest::Method::POST, "token", None)?
            .query(&[("grant_type", grant_type)])
            .json(body);
        self.send_json::<TokenResponse>(req).await?.into_session()
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    #[tracing::instrument(err, skip_all, fields(url = %self.url))]
    async fn refresh_token(&self, refresh_token: &RefreshTokenRef) -> Result<Session, AuthError> {
        tracing::trace!("requesting token refresh");
        self.token_grant("refresh_token", &RefreshTokenGrant { refresh_token })
            .await
    }

    #[tracing::instrument(err, skip_all, fields(url = %self.url))]
    async fn get_user(&self, jwt: &AccessTokenRef) -> Result<User, AuthError> {
        let req = self.request(reqwest::Method::GET, "user", Some(jwt))?;
        self.send_json(req).await
    }

    #[tracing::instrument(err, skip_all, fields(url = %self.url))]
    async fn update_user(
        &self,
        jwt: &AccessTokenRef,
        attributes: &UserAttributes,
    ) -> Result<User, AuthError> {
        let req = self
            .request(reqwest::Method::PUT, "user", Some(jwt))?
            .json(attributes);
        self.send_json(req).await
    }

    #[tracing::instrument(err, skip_all, fields(url = %self.url, scope = scope.as_str()))]
    async fn sign_out(&self, jwt: &AccessTokenRef, scope: SignOutScope) -> Result<(), AuthError> {
        let req = self
            .request(reqwest::Method::POST, "logout", Some(jwt))?
            .query(&[("scope", scope.as_str())]);
        self.send(req).await.map(|_| ())
    }

    #[tracing::instrument(err, skip_all, fields(url = %self.url))]
    async fn sign_in_with_password(
        &self,
        credentials: &PasswordCredentials,
    ) -> Result<Session, AuthError> {
        self.token_grant("password", credentials).await
    }

    #[tracing::instrument(err, skip_all, fields(url = %self.url))]
    async fn exchange_code_for_session(
        &self,
        auth_code: &AuthCodeRef,
        code_verifier: &CodeVerifierRef,
    ) -> Result<Session, AuthError> {
        self.token_grant(
            "pkce",
            &PkceGrant {
                auth_code,
                code_verifier,
            },
        )
        .await
    }

    #[tracing::instrument(err, skip_all, fields(url = %self.url))]
    async fn fetch_jwks(&self) -> Result<Jwks, AuthError> {
        let req = self.request(reqwest::Method::GET, ".well-known/jwks.json", None)?;
        self.send_json(req).await
    }
}
