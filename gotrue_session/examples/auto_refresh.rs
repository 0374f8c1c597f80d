use std::{path::PathBuf, time::Duration};

use clap::Parser;
use gotrue_session::{
    api::{http::HttpAuthApi, PasswordCredentials},
    config::ClientConfig,
    lock::file::FileLock,
    storage::FileStorage,
    AuthClient, SessionStatus,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The auth server's base URL, e.g. `https://<project>.supabase.co/auth/v1`
    #[clap(short, long, env = "GOTRUE_URL")]
    url: reqwest::Url,

    /// The public API key sent with every request
    #[clap(short = 'k', long, env = "GOTRUE_API_KEY", hide_env_values = true)]
    api_key: String,

    /// The directory holding the stored session and its lock files
    #[clap(short = 'd', long, env = "GOTRUE_STORAGE_DIR", default_value = ".auth")]
    storage_dir: PathBuf,

    /// Email to sign in with when no session is stored
    #[clap(short, long, env = "GOTRUE_EMAIL", requires = "password")]
    email: Option<String>,

    /// Password to sign in with when no session is stored
    #[clap(short, long, env = "GOTRUE_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let http = reqwest::Client::builder().https_only(true).build()?;
    let api = HttpAuthApi::new(http, opts.url, opts.api_key);

    let config = ClientConfig::default()
        .with_storage(FileStorage::new(&opts.storage_dir))
        .with_lock(FileLock::new(&opts.storage_dir));
    let client = AuthClient::new(api, config);

    let _subscription = client.on_auth_state_change(|event, session| {
        tracing::info!(
            %event,
            expires_at = ?session.and_then(|s| s.expires_at()),
            "auth state changed"
        );
    });

    if client.get_session().await?.is_none() {
        if let (Some(email), Some(password)) = (opts.email, opts.password) {
            client
                .sign_in_with_password(&PasswordCredentials::Email { email, password })
                .await?;
        } else {
            tracing::warn!("no stored session and no credentials, waiting for another sign-in");
        }
    }

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        let session = match client.get_session().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::info!("signed out");
                continue;
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to read the session");
                continue;
            }
        };

        let status = session.status_with_clock(&gotrue_clock::System);
        let expires_at = session.expires_at().map(|at| at.0);
        match status {
            SessionStatus::Fresh => {
                tracing::debug!(?status, expires_at, "pulled session")
            }
            SessionStatus::Expiring => {
                tracing::warn!(?status, expires_at, "pulled session")
            }
            SessionStatus::Expired => {
                tracing::error!(?status, expires_at, "pulled session")
            }
        }
    }
}
