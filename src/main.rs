//! Process entry for the sync engine
//!
//! Launched by the parent UI process with `--mode sync|test|migrate`. The
//! account (and identity) arrive as JSON lines on stdin; everything the
//! engine emits goes to stdout as line-delimited JSON.

use anyhow::{anyhow, Context, Result};
use mailsync::config::{Account, Config, Identity};
use mailsync::dav::DavWorker;
use mailsync::delta::DeltaStream;
use mailsync::dispatcher::Dispatcher;
use mailsync::imap::worker::{SyncSignals, SyncWorker};
use mailsync::imap::ImapConnection;
use mailsync::metadata::{ExpirationWaker, MetadataExpirationWorker, MetadataStreamWorker};
use mailsync::oauth::TokenManager;
use mailsync::store::MailStore;
use serde_json::json;
use std::io::BufRead;
use std::sync::Arc;
use tracing::info;

fn parse_mode() -> String {
    let args: Vec<String> = std::env::args().collect();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix("--mode=") {
            return value.to_string();
        }
        if (arg == "--mode" || arg == "-m") && idx + 1 < args.len() {
            return args[idx + 1].clone();
        }
    }
    "sync".to_string()
}

fn read_stdin_json_line() -> Result<serde_json::Value> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading stdin")?;
    if line.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(line.trim()).context("parsing stdin JSON")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = parse_mode();
    let config = Arc::new(Config::from_env().map_err(|e| anyhow!("{}", e))?);

    if mode == "migrate" {
        let runtime = tokio::runtime::Runtime::new()?;
        return runtime.block_on(async {
            let stream = DeltaStream::stdout();
            let account: Account = serde_json::from_value(read_stdin_json_line()?)
                .context("account JSON required on stdin")?;
            MailStore::open(&config.database_path(&account.id), stream)
                .await
                .map_err(|e| anyhow!("{}", e))?;
            info!("migrations complete");
            Ok(())
        });
    }

    let account: Account = serde_json::from_value(read_stdin_json_line()?)
        .context("account JSON required on stdin")?;
    if let Some(missing) = account.validate() {
        return Err(anyhow!("account JSON is missing {}", missing));
    }
    let identity: Identity = serde_json::from_value(read_stdin_json_line()?).unwrap_or_default();
    let account = Arc::new(account);

    let runtime = tokio::runtime::Runtime::new()?;
    match mode.as_str() {
        "test" => {
            let code = runtime.block_on(run_test_auth(account));
            std::process::exit(code);
        }
        "sync" => {
            let code = runtime.block_on(run_sync(config, account, identity))?;
            std::process::exit(code);
        }
        other => Err(anyhow!("unknown mode: {}", other)),
    }
}

/// Account connectivity check: verify the IMAP and SMTP endpoints accept
/// our credentials and emit exactly one JSON object on stdout.
async fn run_test_auth(account: Arc<Account>) -> i32 {
    let tokens = TokenManager::new();
    let stream = DeltaStream::stdout();

    let result: mailsync::SyncResult<()> = async {
        let token = tokens.token_for(&account).await?;
        let mut conn = ImapConnection::connect(&account, token.as_deref()).await?;
        conn.logout().await;

        let transport = mailsync::smtp::build_transport(&account, token.as_deref())?;
        // lettre's test_connection performs the full EHLO/AUTH exchange.
        use lettre::AsyncTransport;
        transport
            .test_connection()
            .await
            .map_err(mailsync::SyncError::from)?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            stream.emit_raw_immediate(&json!({
                "error": null,
                "error_service": null,
                "log": "",
                "account": &*account,
            }));
            0
        }
        Err(err) => {
            let service = match &err {
                mailsync::SyncError::Smtp(_) => "smtp",
                _ => "imap",
            };
            stream.emit_raw_immediate(&json!({
                "error": err.to_string(),
                "error_service": service,
                "log": format!("{} check failed: {}", service, err),
                "account": null,
            }));
            1
        }
    }
}

async fn run_sync(config: Arc<Config>, account: Arc<Account>, identity: Identity) -> Result<i32> {
    info!(account = %account.id, provider = %account.provider, "starting sync engine");

    let stream = DeltaStream::stdout();
    tokio::spawn(stream.clone().run_flush_loop());

    let store = MailStore::open(&config.database_path(&account.id), stream)
        .await
        .map_err(|e| anyhow!("{}", e))?;

    let tokens = Arc::new(TokenManager::new());
    let signals = SyncSignals::default();
    let expiration_waker = Arc::new(ExpirationWaker::default());

    let background = SyncWorker::new(
        store.clone(),
        account.clone(),
        config.clone(),
        identity.clone(),
        tokens.clone(),
        signals.clone(),
    );
    tokio::spawn(background.run_background());

    let foreground = SyncWorker::new(
        store.clone(),
        account.clone(),
        config.clone(),
        identity.clone(),
        tokens.clone(),
        signals.clone(),
    );
    tokio::spawn(foreground.run_foreground());

    let dav = DavWorker::new(
        store.clone(),
        account.clone(),
        config.clone(),
        identity.clone(),
        tokens.clone(),
    );
    tokio::spawn(dav.run_loop());

    let metadata_stream = MetadataStreamWorker::new(
        store.clone(),
        account.clone(),
        config.clone(),
        identity.clone(),
        expiration_waker.clone(),
    );
    tokio::spawn(metadata_stream.run());

    let expiration = MetadataExpirationWorker::new(
        store.clone(),
        account.id.clone(),
        expiration_waker.clone(),
    );
    tokio::spawn(expiration.run());

    let dispatcher = Dispatcher::new(
        store,
        account,
        config,
        identity,
        signals,
        expiration_waker,
    );
    Ok(dispatcher.run().await)
}
