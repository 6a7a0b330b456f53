use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use mqbgp::transports::mqtt::qos_from_level;
use mqbgp::transports::{Delivery, MqttBroker, MqttConfig, MqttSubscription};
use mqbgp::{Broker, MessageKind, Relay, RelayExit, ReliablePublisher, DEFAULT_IDLE_LIMIT};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Number of input lines buffered between the stdin reader and the relay
const LINE_BUFFER: usize = 1024;
const LISTEN_POLL: Duration = Duration::from_millis(500);
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Relay ExaBGP update events onto an MQTT message bus.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(flatten)]
    broker: BrokerOpts,

    /// Log level
    #[clap(long, value_enum, default_value = "info", env = "MQBGP_LOG_LEVEL", global = true)]
    log_level: LogLevel,

    /// Append logs to this file instead of stderr
    #[clap(long, env = "MQBGP_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read ExaBGP JSON from stdin and publish prefix events (default)
    Relay {
        /// Consecutive empty input lines tolerated before exiting
        #[clap(long, default_value_t = DEFAULT_IDLE_LIMIT)]
        idle_limit: usize,
    },
    /// Subscribe to bus messages and print them as JSON lines
    Listen {
        /// Kind of message to listen for
        #[clap(short, long, value_enum, default_value = "prefix")]
        kind: ListenKind,

        /// Topic filter overriding the topics of the message kind
        #[clap(short, long)]
        topic: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ListenKind {
    /// prefix announcements and withdrawals
    Prefix,
    /// prefix lists, unsolicited and requested
    PrefixList,
    /// prefix list requests
    Request,
}

impl From<ListenKind> for MessageKind {
    fn from(kind: ListenKind) -> Self {
        match kind {
            ListenKind::Prefix => MessageKind::Prefix,
            ListenKind::PrefixList => MessageKind::PrefixList,
            ListenKind::Request => MessageKind::PrefixListRequest,
        }
    }
}

#[derive(Args)]
struct BrokerOpts {
    /// MQTT broker host
    #[clap(long, env = "MQBGP_HOST", default_value = "localhost", global = true)]
    host: String,

    /// MQTT broker port
    #[clap(long, env = "MQBGP_PORT", default_value_t = 1883, global = true)]
    port: u16,

    /// MQTT client id, defaults to `mqbgp-<pid>`
    #[clap(long, env = "MQBGP_CLIENT_ID", global = true)]
    client_id: Option<String>,

    #[clap(long, env = "MQBGP_USER", global = true)]
    user: Option<String>,

    #[clap(long, env = "MQBGP_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Events are published to `<topic-root>/announce` and `<topic-root>/withdraw`
    #[clap(long, env = "MQBGP_TOPIC_ROOT", default_value = "prefix", global = true)]
    topic_root: String,

    /// MQTT QoS level for publishing and subscribing
    #[clap(long, env = "MQBGP_QOS", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2), global = true)]
    qos: u8,

    /// Keep-alive interval in seconds
    #[clap(long, env = "MQBGP_KEEP_ALIVE", default_value_t = 60, global = true)]
    keep_alive: u64,

    /// Seconds to wait for the broker before a send counts as failed
    #[clap(long, env = "MQBGP_SEND_TIMEOUT", default_value_t = 10, global = true)]
    send_timeout: u64,
}

impl BrokerOpts {
    fn to_config(&self, client_suffix: &str) -> MqttConfig {
        let defaults = MqttConfig::default();
        MqttConfig {
            host: self.host.clone(),
            port: self.port,
            client_id: format!(
                "{}{}",
                self.client_id.as_deref().unwrap_or(defaults.client_id.as_str()),
                client_suffix
            ),
            username: self.user.clone(),
            password: self.password.clone(),
            qos: qos_from_level(self.qos).unwrap_or(defaults.qos),
            keep_alive: Duration::from_secs(self.keep_alive),
            send_timeout: Duration::from_secs(self.send_timeout),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    #[value(alias = "warn")]
    Warning,
    Error,
}

impl LogLevel {
    fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn init_logging(level: LogLevel, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = match std::env::var_os("RUST_LOG") {
        Some(_) => EnvFilter::from_default_env(),
        None => EnvFilter::new(format!("none,mqbgp={}", level.as_directive())),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("unable to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        // stdout is the command channel back to ExaBGP
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_level, cli.log_file.as_deref()) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        None => relay(&cli.broker, DEFAULT_IDLE_LIMIT),
        Some(Commands::Relay { idle_limit }) => relay(&cli.broker, idle_limit),
        Some(Commands::Listen { kind, topic }) => listen(&cli.broker, kind.into(), topic),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn relay(opts: &BrokerOpts, idle_limit: usize) -> anyhow::Result<i32> {
    let broker = MqttBroker::new(opts.to_config(""));
    info!(
        "start ExaBGP monitoring, publishing to {} under {}/",
        broker.address(),
        opts.topic_root
    );

    // `None` marks the end of stdin; the interrupt handler keeps its own sender alive
    let (tx, rx) = crossbeam_channel::bounded::<Option<io::Result<Vec<u8>>>>(LINE_BUFFER);
    let interrupt_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(Some(Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "interrupt received",
        ))));
    })
    .context("unable to install interrupt handler")?;

    let mut publisher = ReliablePublisher::new(broker, opts.topic_root.as_str());
    if let Err(e) = publisher.connect() {
        warn!("unable to connect to broker, retrying on first event: {}", e);
    }

    std::thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        loop {
            // lines stay raw bytes; the relay skips the ones that are not UTF-8
            let mut line = Vec::new();
            match stdin.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Some(Ok(line))).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = tx.send(Some(Err(e)));
                    return;
                }
            }
        }
        let _ = tx.send(None);
    });

    let mut relay = Relay::new(publisher).with_idle_limit(idle_limit);
    let exit = relay.run(rx.iter().map_while(|item| item));

    let stats = relay.stats();
    let publisher_stats = relay.publisher().stats();
    info!(
        "relayed {} lines ({} undecodable), {} updates, {} events: {} published, {} dropped, {} reconnects",
        stats.lines,
        stats.decode_errors,
        stats.updates,
        stats.events,
        publisher_stats.published,
        publisher_stats.dropped,
        publisher_stats.reconnects
    );

    Ok(match exit {
        RelayExit::InputError(_) => 1,
        _ => 0,
    })
}

fn listen(opts: &BrokerOpts, kind: MessageKind, topic: Option<String>) -> anyhow::Result<i32> {
    let filters = match topic {
        Some(topic) => vec![topic],
        None => kind.topics(opts.topic_root.as_str()),
    };
    let broker = MqttBroker::new(opts.to_config("-listen"));

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = running.clone();
    ctrlc::set_handler(move || handler_running.store(false, Ordering::SeqCst))
        .context("unable to install interrupt handler")?;

    let stdout = io::stdout();
    let mut subscription: Option<MqttSubscription> = None;
    while running.load(Ordering::SeqCst) {
        if subscription.is_none() {
            match broker.subscribe(&filters) {
                Ok(s) => {
                    info!(
                        "listening for {} messages on {} at {}",
                        kind,
                        filters.join(", "),
                        broker.address()
                    );
                    subscription = Some(s);
                }
                Err(e) => {
                    warn!("unable to subscribe: {}, retry in {:?}", e, RESUBSCRIBE_DELAY);
                    std::thread::sleep(RESUBSCRIBE_DELAY);
                    continue;
                }
            }
        }
        let Some(active) = subscription.as_mut() else {
            continue;
        };

        match active.next_delivery(LISTEN_POLL) {
            Ok(Some(delivery)) => print_delivery(&mut stdout.lock(), kind, &delivery)?,
            Ok(None) => {}
            Err(e) => {
                warn!("subscription lost: {}", e);
                subscription = None;
            }
        }
    }

    if let Some(active) = subscription {
        if let Err(e) = active.close() {
            warn!("error while disconnecting: {}", e);
        }
    }
    info!("stop listening");
    Ok(0)
}

fn print_delivery(
    out: &mut impl Write,
    kind: MessageKind,
    delivery: &Delivery,
) -> anyhow::Result<()> {
    let message = match kind.decode(&delivery.payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("skip undecodable {} message on {}: {}", kind, delivery.topic, e);
            return Ok(());
        }
    };

    let line = json!({
        "received": chrono::Utc::now().to_rfc3339(),
        "topic": delivery.topic,
        "message": message,
    });
    writeln!(out, "{}", line).context("unable to write to stdout")?;
    Ok(())
}
