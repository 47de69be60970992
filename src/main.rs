//! Демонстрационный бинарь busline.
//!
//! `listen` принимает дуплексные HTTP-соединения и печатает сообщения
//! подписанных каналов, `send` открывает соединение и публикует одно
//! сообщение, дожидаясь ответа.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use busline::{
    callback,
    logging::{init_logging, LogFormat},
    transport::http::{HttpConfig, HttpConsumer, HttpProducer, HttpPublisher},
    BusError, Cancel, EnvelopeIn, EnvelopeOut, Headers, Publisher, Settings, Subscriber,
};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "busline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "busline - publish/subscribe over duplex HTTP connections", long_about = None)]
struct Cli {
    /// Файл настроек (TOML); переменные BUSLINE_* перекрывают его
    #[arg(short, long, env = "BUSLINE_CONFIG")]
    config: Option<PathBuf>,
    /// Формат логов
    #[arg(long, value_parser = parse_format)]
    log_format: Option<LogFormat>,
    /// Включить подробный вывод (debug)
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Принимать соединения и печатать сообщения каналов
    Listen {
        /// Адрес прослушивания; по умолчанию из настроек
        #[arg(short, long)]
        listen: Option<String>,
        /// Каналы для подписки
        #[arg(required = true)]
        channels: Vec<String>,
    },
    /// Отправить одно сообщение в канал
    Send {
        /// Адрес сервера
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        address: String,
        #[arg(long)]
        channel: String,
        #[arg(long, default_value = "text/plain")]
        content_type: String,
        /// Заголовки в виде name=value
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        payload: String,
    },
}

fn parse_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(cli.config.as_deref()).context("failed to load settings")?;
    if cli.verbose {
        settings.logging.level = "debug".to_string();
    }
    if let Some(format) = cli.log_format {
        settings.logging.console.format = format;
    }
    let logging = init_logging(settings.logging.clone())
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to initialize logging")?;
    info!(
        commit = env!("GIT_COMMIT"),
        built = env!("BUILD_TIME"),
        "busline starting"
    );

    let http = HttpConfig::from(&settings.http);
    let result = match cli.command {
        Command::Listen { listen, channels } => {
            let address = listen.unwrap_or_else(|| settings.listen_address.clone());
            run_listen(&address, http, channels).await
        }
        Command::Send {
            address,
            channel,
            content_type,
            headers,
            payload,
        } => run_send(&address, http, &channel, &content_type, &headers, payload).await,
    };

    logging.shutdown();
    result
}

async fn run_listen(
    address: &str,
    config: HttpConfig,
    channels: Vec<String>,
) -> Result<()> {
    let consumer = HttpConsumer::bind(address, config)
        .await
        .with_context(|| format!("failed to listen on {address}"))?;
    println!("listening on {}", consumer.local_addr());

    let cancel = Cancel::new();
    let mut receivers = Vec::new();
    for channel in channels {
        let subscriber = consumer.open(&channel, None).await?;
        let cancel = cancel.clone();
        receivers.push(tokio::spawn(async move {
            let print = callback(move |mut envelope: EnvelopeIn| async move {
                let payload = envelope.read();
                println!(
                    "[{}] {} ({} bytes): {}",
                    envelope.address(),
                    envelope.content_type().unwrap_or("-"),
                    payload.len(),
                    String::from_utf8_lossy(&payload)
                );
                Ok(())
            });
            subscriber.receive(print, &cancel).await
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    info!("shutdown requested");
    cancel.cancel();
    for receiver in receivers {
        match receiver.await {
            Ok(Err(err)) if !err.is_cancelled() => warn!(error = %err, "receive ended"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "receive task failed"),
        }
    }
    consumer.shutdown().await?;
    Ok(())
}

async fn run_send(
    address: &str,
    config: HttpConfig,
    channel: &str,
    content_type: &str,
    headers: &[String],
    payload: String,
) -> Result<()> {
    let headers: Headers = headers
        .iter()
        .map(|h| {
            h.split_once('=')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .with_context(|| format!("header '{h}' is not name=value"))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .collect();

    let producer = HttpProducer::new(address, config);
    let publisher = producer.open(channel, None).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_response = callback(move |mut envelope: EnvelopeIn| {
        let tx = tx.clone();
        async move {
            let status = envelope.bindings().as_http().and_then(|h| h.status_code);
            let _ = tx.send((status, envelope.read()));
            Ok(())
        }
    });

    let mut envelope = EnvelopeOut::new();
    envelope.write(payload.as_bytes());
    envelope.set_content_type(content_type);
    envelope.set_headers(headers);

    // Обработчик ответов регистрируется при первом опросе `receive`,
    // поэтому он опрашивается раньше отправки.
    let cancel = Cancel::new();
    let receive = publisher.connection().receive(on_response, &cancel);
    let conversation = async {
        let result = exchange(&publisher, envelope, &mut rx).await;
        cancel.cancel();
        result
    };
    let (_, result) = futures::future::join(receive, conversation).await;
    result?;

    publisher.close().await?;
    Ok(())
}

async fn exchange(
    publisher: &HttpPublisher,
    envelope: EnvelopeOut,
    responses: &mut mpsc::UnboundedReceiver<(Option<u16>, Bytes)>,
) -> Result<()> {
    publisher.send(vec![envelope]).await?;
    match tokio::time::timeout(Duration::from_secs(10), responses.recv()).await {
        Ok(Some((status, body))) => {
            println!(
                "{} {}",
                status.map_or_else(|| "-".to_string(), |s| s.to_string()),
                String::from_utf8_lossy(&body)
            );
            Ok(())
        }
        Ok(None) => Err(BusError::closed("connection before a response").into()),
        Err(_) => Err(BusError::timeout("response").into()),
    }
}
