//! Streams one chat completion through the resilient client and prints it.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use resilient_stream::interceptor::{
    AuthenticationInterceptor, CompressionInterceptor, ErrorNormalizationInterceptor,
    LoggingInterceptor, MetricsInterceptor, RequestMetricsSink, RetryMarkingInterceptor,
    StaticCredentials,
};
use resilient_stream::metrics::MetricsCollector;
use resilient_stream::quality::HttpProbe;
use resilient_stream::{
    OutboundRequest, ReqwestTransport, ResilienceConfig, StreamClient, StreamEvent,
    init_observability,
};

#[derive(Parser, Debug)]
#[command(name = "rstream", about = "Stream a chat completion over an unreliable network")]
struct Args {
    /// Chat completions endpoint.
    #[arg(long, default_value = "https://api.openai.com/v1/chat/completions")]
    url: String,
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,
    #[arg(long)]
    prompt: String,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: String,
    /// Print detailed network metrics as JSON when the stream ends.
    #[arg(long)]
    summary: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_observability();
    let args = Args::parse();

    let config = ResilienceConfig::from_env()?;
    let metrics = MetricsCollector::spawn(&config);
    let sink: Arc<dyn RequestMetricsSink> = Arc::new(metrics.clone());
    let client = StreamClient::builder()
        .transport(Arc::new(ReqwestTransport::new(Duration::from_secs(10))?))
        .probe(Arc::new(HttpProbe::new(Duration::from_secs(3))?))
        .metrics(metrics)
        .interceptor(Arc::new(AuthenticationInterceptor::new(Arc::new(
            StaticCredentials(args.api_key.clone()),
        ))))
        .interceptor(Arc::new(CompressionInterceptor::new(["gzip"])))
        .interceptor(Arc::new(LoggingInterceptor))
        .interceptor(Arc::new(MetricsInterceptor::new(Some(sink))))
        .interceptor(Arc::new(RetryMarkingInterceptor))
        .interceptor(Arc::new(ErrorNormalizationInterceptor))
        .config(config)
        .build()?;

    let initial = client.quality().sample_now().await?;
    tracing::info!(
        bucket = ?initial.bucket,
        strategy = %initial.strategy,
        "initial network sample"
    );

    let request = OutboundRequest::post_stream(
        args.url,
        serde_json::json!({
            "model": args.model,
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": [{"role": "user", "content": args.prompt}],
        }),
    );
    let mut stream = client.stream(request)?;
    let cancel = stream.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::ContentDelta { text, .. } => {
                print!("{text}");
                stdout.flush()?;
            }
            StreamEvent::Discontinuity { connection } => {
                eprintln!("\n[reconnected, connection {connection}]");
            }
            StreamEvent::ToolInvocation { name, arguments, .. } => {
                eprintln!("\n[tool call {name}: {arguments:?}]");
            }
            StreamEvent::UsageSummary(usage) => {
                tracing::info!(?usage, "usage");
            }
            StreamEvent::Failed(failure) => eprintln!("\n{failure}"),
            StreamEvent::Terminal { .. } | StreamEvent::ToolResult { .. } => {}
        }
    }
    println!();
    let result = stream.finish().await;

    if args.summary {
        client.metrics().compute_now().await?;
        println!("{}", serde_json::to_string_pretty(&client.detailed_metrics())?);
    }
    client.shutdown().await;
    result?;
    Ok(())
}
