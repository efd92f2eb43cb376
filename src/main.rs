use std::{
    process,
    sync::{Arc, OnceLock},
};

use sensorbridge::{
    config::Config,
    core::{
        classifier::AnomalyRules, dispatcher::Dispatcher, persistence::MySqlGateway,
        readiness::Readiness, relay::MessageRelay,
    },
    logger::LoggerManager,
    print_error,
};
use sensorbridge_transport::{amqp::QueuePublisherLink, mqtt::SubscriberLink};
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn log_rules_table(rules: &AnomalyRules) {
    let name_width = rules
        .iter()
        .map(|(sensor, _)| sensor.len())
        .max()
        .unwrap_or(10)
        .max("Sensor".len());

    let header = format!(
        "{:<width$} | Stored if | Flagged outbound if",
        "Sensor",
        width = name_width
    );
    let sep = format!("{}-+-{}-+-{}", "-".repeat(name_width), "-".repeat(9), "-".repeat(19));

    info!("{}", header);
    info!("{}", sep);

    for (sensor, rule) in rules.iter() {
        let stored = format!("{} {}", rule.comparator.as_str(), rule.threshold);
        let outbound = match rule.outbound_threshold {
            Some(threshold) => format!("{} {}", rule.comparator.as_str(), threshold),
            None => "same".to_string(),
        };
        info!("{:<width$} | {:<9} | {}", sensor, stored, outbound, width = name_width);
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown..."),
            Err(e) => error!("Failed to listen for Ctrl+C, shutting down: {}", e),
        },
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting sensorbridge version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);

    let rules = Arc::new(AnomalyRules::from_config(&cfg.anomaly));
    log_rules_table(&rules);

    let shutdown = CancellationToken::new();
    let links = CancellationToken::new();
    let (deliver_tx, deliver_rx) = mpsc::channel(cfg.relay.channel_capacity);

    let subscriber = SubscriberLink::from_config(&cfg.mqtt, deliver_tx, links.child_token())
        .unwrap_or_else(|e| {
            error!("Failed to create MQTT subscriber: {}", e);
            process::exit(1);
        });
    let publisher = QueuePublisherLink::from_config(&cfg.amqp, links.child_token())
        .unwrap_or_else(|e| {
            error!("Failed to create AMQP publisher: {}", e);
            process::exit(1);
        });
    info!(
        "Subscribing to '{}', publishing to queue '{}'",
        cfg.mqtt.topic, cfg.amqp.queue
    );

    let readiness = Readiness::default();
    readiness.start_listening(subscriber.subscribe_state(), publisher.subscribe_state());
    let queue = publisher.handle();

    let subscriber_task = tokio::spawn(subscriber.run());
    let publisher_task = tokio::spawn(publisher.run());

    let gateway = Arc::new(MySqlGateway::from_config(&cfg.database));
    let relay = Arc::new(MessageRelay::new(gateway.clone(), rules, Arc::new(queue)));
    let dispatcher = Dispatcher::new(relay, deliver_rx, &cfg.relay, readiness);

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let stats = dispatcher.run(shutdown).await;
    info!("Dispatcher stopped after {} message(s)", stats.dispatched);

    links.cancel();
    let (subscriber_result, publisher_result) = tokio::join!(subscriber_task, publisher_task);
    for (name, result) in [("MQTT", subscriber_result), ("AMQP", publisher_result)] {
        if let Err(e) = result {
            error!("{} link task failed: {}", name, e);
        }
    }
    gateway.close().await;

    info!("Shutdown complete");
    Ok(())
}
