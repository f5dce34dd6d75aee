use carrier_pigeon::amqp::configuration::{PipelineSettings, RabbitMqSettings};
use carrier_pigeon::amqp::ExchangeKind;
use carrier_pigeon::pipeline::{PendingMessage, PublishPipeline};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // First of all we build the configuration for our pipeline.
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = RabbitMqSettings::default();

    // Our publishers must be resilient to network issues: the pipeline keeps
    // the connection alive in the background and multiplexes publishes over a
    // fixed-size pool of channels, each of which re-opens on its own whenever
    // it breaks.
    //
    // With `publisher_confirms` enabled every publish waits for the broker's
    // acknowledgement - publishing to an exchange nobody listens to will fail
    // instead of silently dropping the message.
    let pipeline = PublishPipeline::builder(settings)
        .pipeline_settings(PipelineSettings {
            channels: 4,
            publisher_confirms: true,
            ..PipelineSettings::default()
        })
        .build()?;

    // Block until every channel has connected once, so we do not race a cold
    // pool right after startup.
    pipeline
        .wait_for_first_connect(Duration::from_secs(10))
        .await?;

    pipeline
        .exchange_declare("hello-exchange", ExchangeKind::Direct, true)
        .await?;

    // The direct path returns the broker's verdict for this very message.
    let outcome = pipeline
        .publish(&PendingMessage::new(
            "hello-exchange",
            "hello",
            "Hello world!".as_bytes().into(),
        ))
        .await?;
    println!(
        "published: confirmed={} delivery_tag={}",
        outcome.confirmed, outcome.delivery_tag
    );

    // The queued path is fire-and-forget: delivery is retried in the
    // background and reported to the observer, never to this caller.
    pipeline.publish_content("hello-exchange", "hello", b"Hello again!".to_vec())?;

    pipeline.close().await;
    Ok(())
}
