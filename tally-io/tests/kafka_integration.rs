#![cfg(feature = "kafka")]

use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tally_core::{Fetch, InvoiceRecord, PartitionId, Source, SourcePositions};
use tally_io::KafkaSource;

#[tokio::test]
async fn kafka_reads_invoices_and_resumes_if_env_present() {
    let brokers = match std::env::var("KAFKA_BROKER") {
        Ok(v) => v,
        Err(_) => return,
    }; // skip if not configured
    let topic = match std::env::var("KAFKA_TOPIC") {
        Ok(v) => v,
        Err(_) => return,
    };

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        .create()
        .expect("producer");
    for i in 0..2 {
        let payload = serde_json::json!({
            "InvoiceNo": format!("IT{i}"),
            "StockCode": "85123A",
            "Description": "WHITE HANGING HEART T-LIGHT HOLDER",
            "Quantity": 6,
            "InvoiceDate": "12/1/2010 8:26",
            "UnitPrice": 2.55,
            "CustomerID": "17850",
            "Country": "United Kingdom"
        })
        .to_string();
        producer
            .send(FutureRecord::<(), _>::to(&topic).payload(&payload), Duration::from_secs(5))
            .await
            .expect("produce");
    }

    let group = format!(
        "tally-it-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );
    let mut src = KafkaSource::new(brokers, group, vec![topic.clone()]);
    let mut readers = src.open(&SourcePositions::new()).await.unwrap();
    assert!(!readers.is_empty());

    // Read every partition up to its end and remember the highest offset seen.
    let mut last: Option<(PartitionId, i64)> = None;
    let mut decoded = 0usize;
    for reader in readers.iter_mut() {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), reader.poll()).await {
                Ok(Ok(Fetch::Message(m))) => {
                    if InvoiceRecord::decode(&m.payload).is_ok() {
                        decoded += 1;
                    }
                    last = Some((m.partition.clone(), m.position));
                }
                _ => break,
            }
        }
    }
    assert!(decoded >= 2, "did not receive the produced invoices");

    // Reopening after the last seen offset delivers nothing older than it.
    let (partition, offset) = last.unwrap();
    let mut resume = SourcePositions::new();
    resume.advance(&partition, offset);
    let mut readers = src.open(&resume).await.unwrap();
    for reader in readers.iter_mut().filter(|r| r.partition() == &partition) {
        if let Ok(Ok(Fetch::Message(m))) = tokio::time::timeout(Duration::from_secs(5), reader.poll()).await {
            assert!(m.position > offset);
        }
    }
}
