//! Kafka transport (feature `kafka`).

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::{Message, Offset, TopicPartitionList};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::{mpsc, oneshot};

use crate::transport::{Delivery, Envelope, Subscription, Transport};
use crate::{BusError, Result};

pub struct KafkaTransport {
    producer: FutureProducer,
    brokers: String,
    group_id: String,
}

impl KafkaTransport {
    pub fn new(brokers: &[String], group_id: &str) -> Result<Self> {
        let brokers = brokers.join(",");
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self {
            producer,
            brokers,
            group_id: group_id.to_string(),
        })
    }

    fn create_consumer(&self) -> Result<StreamConsumer> {
        let consumer = ClientConfig::new()
            .set("group.id", &self.group_id)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        Ok(consumer)
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        self.producer
            .send(
                FutureRecord::to(topic).payload(payload).key(key),
                Duration::from_secs(5),
            )
            .await
            .map_err(|(e, _)| BusError::Kafka(e))?;
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription> {
        let consumer = self.create_consumer()?;
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&names)?;

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut stream = consumer.stream();
            while let Some(result) = stream.next().await {
                let (envelope, position) = match result {
                    Ok(message) => (
                        Envelope {
                            topic: message.topic().to_string(),
                            key: message
                                .key()
                                .map(|k| String::from_utf8_lossy(k).into_owned())
                                .unwrap_or_default(),
                            payload: message
                                .payload()
                                .map(|p| String::from_utf8_lossy(p).into_owned())
                                .unwrap_or_default(),
                        },
                        (message.topic().to_string(), message.partition(), message.offset()),
                    ),
                    Err(e) => {
                        tracing::error!(error = %e, "kafka receive failed");
                        continue;
                    }
                };
                let (ack_tx, ack_rx) = oneshot::channel();
                if tx.send(Delivery::with_ack(envelope, ack_tx)).await.is_err() {
                    break;
                }
                // Offsets move only after the consumer has parked the message.
                if ack_rx.await.is_ok() {
                    let (topic, partition, offset) = position;
                    let mut tpl = TopicPartitionList::new();
                    let committed = tpl
                        .add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
                        .and_then(|_| consumer.commit(&tpl, CommitMode::Async));
                    if let Err(e) = committed {
                        tracing::warn!(error = %e, %topic, partition, offset, "kafka commit failed");
                    }
                }
            }
            tracing::info!("kafka subscription closed");
        });
        Ok(rx)
    }
}

impl std::fmt::Debug for KafkaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaTransport")
            .field("brokers", &self.brokers)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}
