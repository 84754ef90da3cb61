use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mailwatch", version, about = "Watch a mailbox for a trigger message")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// Properties file with client.id, tenant.id and app.email
    #[arg(long, global = true, env = "MAILWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Token cache location
    #[arg(long, global = true, env = "MAILWATCH_TOKEN_PATH")]
    token_path: Option<PathBuf>,

    #[command(flatten)]
    account: AccountArgs,
}

#[derive(Debug, Args)]
struct AccountArgs {
    /// Application (client) id registered in Entra ID
    #[arg(long, global = true)]
    client_id: Option<String>,

    /// Directory (tenant) id
    #[arg(long, global = true)]
    tenant_id: Option<String>,

    /// Mailbox address to watch
    #[arg(long, global = true)]
    email: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch the inbox until interrupted
    Watch(WatchArgs),
    /// Sign in (device code if needed) and cache the token
    Auth,
    /// Show cached token state
    Status,
    /// Delete the cached token
    ClearCache,
    /// Persist the account flags into the properties file
    Configure,
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Subject that triggers a notification
    #[arg(long)]
    subject: Option<String>,

    /// IMAP host
    #[arg(long)]
    host: Option<String>,

    /// IMAP port
    #[arg(long)]
    port: Option<u16>,

    /// Seconds before an IDLE command is re-issued
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};

    use mailwatch::auth::{OAuth2Authenticator, ReqwestHttp, TokenStore};
    use mailwatch::config::{AccountConfig, ConfigFile, MonitorSettings};
    use mailwatch::events::{EventSink, SessionEvent};
    use mailwatch::mail::{ImapConnector, MailMonitor};
    use mailwatch::output::{self, OutputFormat, TokenStatus};
    use mailwatch::session::MonitoringSession;

    use super::{AccountArgs, Cli, Commands, WatchArgs};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let format = OutputFormat::from_json_flag(cli.json);
        let config_path = match cli.config {
            Some(path) => path,
            None => ConfigFile::default_path().context("resolve default config path")?,
        };
        let token_path = match cli.token_path {
            Some(path) => path,
            None => TokenStore::default_path().context("resolve default token cache path")?,
        };

        match cli.command {
            Commands::Watch(args) => {
                handle_watch(&config_path, &token_path, &cli.account, args, format).await
            }
            Commands::Auth => handle_auth(&config_path, &token_path, &cli.account, format).await,
            Commands::Status => handle_status(&config_path, &token_path, &cli.account, format),
            Commands::ClearCache => handle_clear_cache(&token_path),
            Commands::Configure => handle_configure(&config_path, &cli.account),
        }
    }

    fn load_account(config_path: &Path, flags: &AccountArgs) -> Result<AccountConfig> {
        let file = ConfigFile::load(config_path)
            .with_context(|| format!("read config file {}", config_path.display()))?;
        let mut account = file.account().with_env_overrides();
        if let Some(client_id) = &flags.client_id {
            account.client_id = client_id.clone();
        }
        if let Some(tenant_id) = &flags.tenant_id {
            account.tenant_id = tenant_id.clone();
        }
        if let Some(email) = &flags.email {
            account.email = email.clone();
        }
        Ok(account)
    }

    fn open_store(token_path: &Path) -> Result<Arc<TokenStore>> {
        let store = TokenStore::from_env(token_path)
            .with_context(|| format!("open token cache at {}", token_path.display()))?;
        Ok(Arc::new(store))
    }

    fn authenticator(store: Arc<TokenStore>, settings: &MonitorSettings) -> Arc<OAuth2Authenticator> {
        Arc::new(OAuth2Authenticator::new(
            store,
            Arc::new(ReqwestHttp::new()),
            settings.authority.clone(),
        ))
    }

    async fn handle_watch(
        config_path: &Path,
        token_path: &Path,
        flags: &AccountArgs,
        args: WatchArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let account = load_account(config_path, flags)?;
        let mut settings = MonitorSettings::from_env();
        if let Some(subject) = args.subject {
            settings.trigger_subject = subject;
        }
        if let Some(host) = args.host {
            settings.imap_host = host;
        }
        if let Some(port) = args.port {
            settings.imap_port = port;
        }
        if let Some(seconds) = args.idle_timeout_secs {
            settings.idle_timeout = Duration::from_secs(seconds.max(1));
        }

        let authenticator = authenticator(open_store(token_path)?, &settings);
        let connector = Arc::new(ImapConnector::from_settings(&settings));
        let monitor = Arc::new(MailMonitor::new(connector, authenticator.clone(), settings));
        let session = MonitoringSession::new(account, authenticator, monitor);

        let (sink, mut events) = EventSink::channel();
        session.start(sink);

        let mut failure = None;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    println!("{}", output::format_event(format, &event)?);
                    if let SessionEvent::Error(error) = event {
                        failure = Some(error);
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listen for Ctrl-C")?;
                    session.stop();
                    session.wait().await;
                    while let Ok(event) = events.try_recv() {
                        println!("{}", output::format_event(format, &event)?);
                    }
                    break;
                }
            }
        }

        match failure {
            Some(error) => Err(anyhow!(error)).context("monitoring session failed"),
            None => Ok(()),
        }
    }

    async fn handle_auth(
        config_path: &Path,
        token_path: &Path,
        flags: &AccountArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let account = load_account(config_path, flags)?;
        account.validate()?;
        let settings = MonitorSettings::from_env();
        let store = open_store(token_path)?;
        let authenticator = authenticator(store.clone(), &settings);

        let (sink, mut events) = EventSink::channel();
        let cancel = tokio_util::sync::CancellationToken::new();
        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match output::format_event(format, &event) {
                    Ok(line) => println!("{line}"),
                    Err(error) => eprintln!("failed to render event: {error}"),
                }
            }
        });

        let outcome = tokio::select! {
            result = authenticator.get_access_token(&account, &sink, &cancel) => result,
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for Ctrl-C")?;
                cancel.cancel();
                return Err(anyhow!("sign in interrupted"));
            }
        };
        drop(sink);
        let _ = printer.await;
        outcome.context("obtain access token")?;

        let status = TokenStatus::new(
            store.path().display().to_string(),
            store.is_encrypted(),
            authenticator.cached_record(&account).as_ref(),
        );
        println!("{}", output::format_status(format, &status)?);
        Ok(())
    }

    fn handle_status(
        config_path: &Path,
        token_path: &Path,
        flags: &AccountArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let account = load_account(config_path, flags)?;
        let store = open_store(token_path)?;
        let record = store.load(&account.key());
        let status = TokenStatus::new(
            store.path().display().to_string(),
            store.is_encrypted(),
            record.as_ref(),
        );
        println!("{}", output::format_status(format, &status)?);
        Ok(())
    }

    fn handle_clear_cache(token_path: &Path) -> Result<()> {
        TokenStore::new(token_path)
            .clear()
            .with_context(|| format!("delete token cache at {}", token_path.display()))?;
        println!("Token cache cleared: {}", token_path.display());
        Ok(())
    }

    fn handle_configure(config_path: &Path, flags: &AccountArgs) -> Result<()> {
        let mut file = ConfigFile::load(config_path)
            .with_context(|| format!("read config file {}", config_path.display()))?;
        let updates = [
            ("client.id", &flags.client_id),
            ("tenant.id", &flags.tenant_id),
            ("app.email", &flags.email),
        ];
        let mut changed = 0;
        for (key, value) in updates {
            if let Some(value) = value {
                file.set(key, value.trim());
                changed += 1;
            }
        }
        if changed == 0 {
            return Err(anyhow!(
                "nothing to save; pass --client-id, --tenant-id or --email"
            ));
        }
        file.save(config_path)
            .with_context(|| format!("write config file {}", config_path.display()))?;
        println!("Saved {changed} setting(s) to {}", config_path.display());
        Ok(())
    }
}
