use clap::Parser;
use kafka_source_producer::{publish_test_orders, KafkaTestProducer};

/// Publish sample order records for exercising the Kafka source
///
/// To run this producer:
/// 1. Start Kafka with Docker:
///    docker run -d --name kafka -p 9092:9092 apache/kafka:latest
/// 2. Run the producer:
///    cargo run -p kafka-source-producer -- --topic orders --count 20
/// 3. Run the source in another terminal:
///    KAFKA_CONFIG="$(cat config.yaml)" cargo run -- run
#[derive(Parser, Debug)]
#[command(name = "kafka-producer")]
#[command(about = "Publish sample records to a Kafka topic")]
struct Args {
    /// Kafka bootstrap broker
    #[arg(long, env = "KAFKA_BROKER", default_value = "localhost:9092")]
    broker: String,

    /// Topic to publish to, created when missing
    #[arg(long, default_value = "orders")]
    topic: String,

    /// Partitions of the topic when it has to be created
    #[arg(long, default_value = "3")]
    partitions: i32,

    /// Number of records to publish
    #[arg(long, default_value = "10")]
    count: usize,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match run_main(args).await {
        Ok(_) => println!("Producer finished successfully"),
        Err(e) => {
            eprintln!("Error: {e:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main(args: Args) -> anyhow::Result<()> {
    println!("Creating topic '{}' if it doesn't exist...", args.topic);
    let producer = KafkaTestProducer::new(&args.broker).await?;
    producer
        .create_topic_if_not_exists(&args.topic, args.partitions)
        .await?;

    println!("Publishing {} records to topic '{}'...", args.count, args.topic);
    let written = publish_test_orders(&producer, &args.topic, args.count, args.partitions).await?;
    for (i, (partition, offset)) in written.iter().enumerate() {
        println!("Published record {}: partition={partition}, offset={offset}", i + 1);
    }

    println!("\nSuccessfully published {} records to '{}'", written.len(), args.topic);
    Ok(())
}
