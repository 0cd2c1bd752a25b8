use std::sync::Arc;
use std::time::Duration;

use fluux_xmpp::{
    Connection, ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionListener, Iq,
    IqListener, IqType, Jid, Message, MessageListener, Presence, PresenceListener,
    SaslPlainLogin, Stanza,
};

const PASSWORD_ENV: &str = "FLUUX_XMPP_PASSWORD";
const NS_PING: &str = "urn:xmpp:ping";

/// Prints inbound traffic to stdout, as XML or as JSON lines.
struct Printer {
    json: bool,
}

impl Printer {
    fn print(&self, stanza: Stanza) {
        if !self.json {
            println!("{}", stanza);
            return;
        }
        match serde_json::to_string(&stanza) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to serialize stanza: {}", e),
        }
    }
}

impl MessageListener for Printer {
    fn on_message(&self, message: &Message) {
        self.print(message.clone().into());
    }
}

impl PresenceListener for Printer {
    fn on_presence(&self, presence: &Presence) {
        self.print(presence.clone().into());
    }
}

impl ConnectionListener for Printer {
    fn on_connection_failed(&self, message: &str) {
        eprintln!("Connection ended: {}", message);
    }
}

/// Answers XEP-0199 pings so the server does not drop an idle session.
struct PingResponder {
    handle: ConnectionHandle,
}

impl IqListener for PingResponder {
    fn on_iq(&self, iq: &Iq) -> bool {
        let is_ping = iq.kind == IqType::Get
            && iq.query().and_then(|q| q.namespace()) == Some(NS_PING);
        if is_ping {
            tracing::debug!(from = ?iq.from.as_ref().map(|j| j.to_string()), id = %iq.id, "Answering ping");
            self.handle.send(iq.result_reply());
        }
        is_ping
    }
}

fn print_startup_diagnostics() {
    eprintln!("fluux-xmpp v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("---");
}

fn print_help() {
    eprintln!("fluux-xmpp v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-xmpp --jid=JID [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --jid=JID         Account address (user@domain)");
    eprintln!("      --server=SERVER   tls://host:port, tcp://host:port, host:port or domain");
    eprintln!("                        (default: SRV lookup on the account domain)");
    eprintln!("      --resource=NAME   Resource to bind (default: chosen by the server)");
    eprintln!("      --json            Print received stanzas as JSON lines");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP packet content");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform log dir)");
    eprintln!("      --insecure-tls    Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  {}   Account password (required)", PASSWORD_ENV);
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

fn init_tracing(verbose_level: Option<&str>, log_file_path: Option<&str>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // --log-file=<path> overrides the platform data directory
    let log_dir = match log_file_path {
        Some(path) => std::path::PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from(".")),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("com.processone.fluux-xmpp")
            .join("logs"),
    };

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let file_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_xmpp=info,info")
    };

    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-xmpp.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || std::env::var("RUST_LOG").is_ok() {
        let stderr_filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("fluux_xmpp=info,fluux_xmpp::connection=debug,info")
        } else {
            EnvFilter::new("fluux_xmpp=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The guard flushes the background writer when dropped; keep it until
    // process exit.
    std::mem::forget(guard);

    eprintln!("Log file: {}", log_dir.display());
}

async fn run(config: ConnectionConfig, login: SaslPlainLogin, json: bool) -> Result<(), ConnectionError> {
    let connection = Connection::new(config, login);
    let handle = connection.handle();

    let printer = Arc::new(Printer { json });
    handle.add_connection_listener(printer.clone());
    handle.add_message_listener(printer.clone());
    handle.add_presence_listener(printer);
    handle.add_iq_listener(Arc::new(PingResponder {
        handle: handle.clone(),
    }));

    let mut session = tokio::spawn(connection.run());
    tokio::select! {
        result = &mut session => {
            return result.unwrap_or_else(|e| Err(ConnectionError::Io(std::io::Error::other(e))));
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, logging off");
            handle.logoff();
        }
    }

    // The server answers the stream close by closing its side.
    if tokio::time::timeout(Duration::from_secs(5), session).await.is_err() {
        tracing::warn!("Server did not close the stream in time");
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        std::process::exit(0);
    }

    let flag_value = |name: &str| {
        args.iter()
            .find_map(|arg| arg.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')))
            .map(str::to_string)
    };

    // --verbose / -v (no XMPP packets) or --verbose=xmpp (with packets)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let log_file_path = flag_value("--log-file");
    let insecure_tls = args.iter().any(|arg| arg == "--insecure-tls");
    let json = args.iter().any(|arg| arg == "--json");

    init_tracing(verbose_level, log_file_path.as_deref());
    if verbose_level.is_some() {
        print_startup_diagnostics();
    }

    let jid: Jid = match flag_value("--jid").map(|s| s.parse::<Jid>()) {
        Some(Ok(jid)) => jid,
        Some(Err(e)) => {
            eprintln!("Invalid --jid: {}", e);
            std::process::exit(2);
        }
        None => {
            eprintln!("Missing --jid (see --help)");
            std::process::exit(2);
        }
    };
    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) => password,
        Err(_) => {
            eprintln!("Set {} to the account password", PASSWORD_ENV);
            std::process::exit(2);
        }
    };

    if insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    let mut config = ConnectionConfig::new(jid, password).with_insecure_tls(insecure_tls);
    if let Some(server) = flag_value("--server") {
        config = config.with_server_input(&server);
    }
    let mut login = SaslPlainLogin::new();
    if let Some(resource) = flag_value("--resource") {
        login = login.with_resource(resource);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(config, login, json)) {
        Ok(()) => {}
        Err(e) => {
            tracing::error!("Connection ended: {}", e);
            std::process::exit(1);
        }
    }
}
