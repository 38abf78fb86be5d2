use clap::Parser;
use coachlink::core::channel::ChannelEvent;
use coachlink::core::session::{gate, GateDecision, SessionCodec};
use coachlink::core::triage::{self, RosterEntry, TriageSummary, TriageThresholds};
use coachlink::domain::model::CoherenceSnapshot;
use coachlink::utils::error::{PortalError, Result};
use coachlink::utils::{logger, validation::Validate};
use coachlink::{ApiClient, CliArgs, CoherenceChannel, Command, PortalConfig, WsConnector};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // 初始化日誌
    if args.json_logs {
        logger::init_json_logger(args.verbose);
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::debug!("CLI args: {:?}", args);

    if let Err(e) = run(args).await {
        tracing::error!(
            "❌ Command failed: {} (Category: {:?}, Severity: {:?})",
            e,
            e.category(),
            e.severity()
        );

        let toast = e.to_toast();
        eprintln!("❌ {}: {}", toast.title, toast.message);
        eprintln!("💡 建議: {}", e.recovery_suggestion());

        std::process::exit(e.severity().exit_code());
    }

    Ok(())
}

fn load_config(path: &str) -> Result<PortalConfig> {
    tracing::info!("📁 Loading configuration from: {}", path);
    let config = PortalConfig::from_file(path)?;
    config.validate()?;
    tracing::info!("✅ Configuration loaded and validated successfully");
    Ok(config)
}

fn resolve_token(cli_token: Option<String>, config: &PortalConfig) -> Result<String> {
    cli_token
        .or_else(|| config.api_token().map(str::to_string))
        .ok_or_else(|| PortalError::AuthError {
            message: "no API token: pass --token or set COACHLINK_TOKEN".to_string(),
        })
}

async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Triage {
            current,
            derivative,
            trend,
        } => {
            let snapshot = CoherenceSnapshot {
                current,
                derivative,
                trend,
            };
            println!("{}", triage::classify(&snapshot));
            Ok(())
        }
        Command::Roster {
            coach_id,
            min_status,
            csv,
            token,
        } => {
            let config = load_config(&args.config)?;
            let token = resolve_token(token, &config)?;
            let mut client = ApiClient::from_config(&config)?.with_token(token);
            if let Some(timeout) = config.request_timeout() {
                client = client.with_timeout(timeout)?;
            }

            let clients = client.list_clients(coach_id.as_deref()).await?;
            tracing::info!("📂 Fetched {} clients", clients.len());

            let mut entries = triage::triage_roster(&clients, &config.triage_thresholds());
            if let Some(threshold) = min_status {
                entries = triage::filter_at_least(&entries, threshold);
            }

            print_roster(&entries);

            if let Some(path) = csv {
                let file = std::fs::File::create(&path)?;
                triage::write_roster_csv(&entries, file)?;
                tracing::info!("📁 Roster saved to: {}", path);
            }
            Ok(())
        }
        Command::Watch {
            clients,
            all,
            token,
        } => {
            let config = load_config(&args.config)?;
            let token = resolve_token(token, &config)?;
            watch(&config, token, clients, all).await
        }
        Command::Session { cookie, path } => {
            let config = load_config(&args.config)?;
            let secret = config
                .session
                .as_ref()
                .map(|s| s.secret.as_str())
                .ok_or_else(|| PortalError::MissingConfigError {
                    field: "session.secret".to_string(),
                })?;
            let codec = SessionCodec::new(secret, config.cookie_name())?;
            let session = codec.from_cookie_header(&cookie);

            match &session {
                Some(record) => println!(
                    "user={} role={} tenant={}",
                    record.user_id, record.role, record.tenant_id
                ),
                None => println!("no valid session"),
            }

            match gate(&path, session.as_ref()) {
                GateDecision::Allow => println!("allow {}", path),
                GateDecision::Redirect(to) => println!("redirect {} -> {}", path, to),
            }
            Ok(())
        }
    }
}

fn print_roster(entries: &[RosterEntry]) {
    println!("{:<14} {:<24} {:>8} {:>10}  trend", "status", "client", "score", "Δ");
    for entry in entries {
        println!(
            "{:<14} {:<24} {:>8.1} {:>10.3}  {:?}",
            entry.status.as_str(),
            entry.name,
            entry.current,
            entry.derivative,
            entry.trend
        );
    }

    let summary = TriageSummary::from_entries(entries);
    println!(
        "\n📊 {} clients: {} critical, {} warning, {} stable, {} thriving, {} breakthrough",
        summary.total(),
        summary.critical,
        summary.warning,
        summary.stable,
        summary.thriving,
        summary.breakthrough
    );
}

async fn watch(config: &PortalConfig, token: String, clients: Vec<String>, all: bool) -> Result<()> {
    let thresholds: TriageThresholds = config.triage_thresholds();
    let channel = CoherenceChannel::spawn(config.channel_config(), Arc::new(WsConnector::new()));
    let mut events = channel.events();
    channel.connect(token)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 Interrupted, closing channel");
                channel.disconnect()?;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(ChannelEvent::Authenticated) => {
                    if all || clients.is_empty() {
                        channel.subscribe_all_clients()?;
                    } else {
                        for client_id in &clients {
                            channel.subscribe_client(client_id.as_str())?;
                        }
                    }
                }
                Ok(ChannelEvent::CoherenceUpdate(update)) => {
                    let status = thresholds.classify(&update.snapshot());
                    println!(
                        "{} score={:.1} Δ={:.3} trend={:?} -> {}",
                        update.client_id,
                        update.current,
                        update.derivative,
                        update.trend,
                        status
                    );
                }
                Ok(ChannelEvent::CoherenceAlert(alert)) => {
                    println!("⚠️ {} [{:?}] {}", alert.client_id, alert.severity, alert.message);
                }
                Ok(ChannelEvent::ClientConnected { client_id }) => println!("🟢 {} online", client_id),
                Ok(ChannelEvent::ClientDisconnected { client_id }) => println!("⚪ {} offline", client_id),
                Ok(ChannelEvent::AuthFailed { message }) => {
                    return Err(PortalError::AuthError { message });
                }
                Ok(ChannelEvent::GaveUp { attempts }) => {
                    return Err(PortalError::ChannelError {
                        message: format!("gave up after {} reconnect attempts", attempts),
                    });
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event stream lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
