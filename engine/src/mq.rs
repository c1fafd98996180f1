//! Durable message bus client (AMQP 0.9.1).
//!
//! Three logical streams decouple the stages: `validation`, `aggregation`
//! and `review`. All queues are durable and all messages persistent; the
//! validation and aggregation queues carry a length cap and dead-letter to
//! review, so the broker sheds load by rejecting publishes rather than by
//! growing without bound. Publishes are broker-confirmed, consumption is
//! manual-ack with bounded prefetch.

use crate::{
	error::{PipelineError, Result},
	settings,
};
use async_trait::async_trait;
use lapin::{
	message::Delivery,
	options::{
		BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
		BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
		QueueDeclareOptions,
	},
	publisher_confirm::Confirmation,
	types::{AMQPValue, FieldTable},
	BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::time::Duration;

pub const EXCHANGE: &str = "vote";

pub const VALIDATION_LAW_KEY: &str = "vote.validation.law";
pub const VALIDATION_ELECTION_KEY: &str = "vote.validation.election";
pub const AGGREGATION_KEY: &str = "vote.aggregation";
pub const REVIEW_KEY: &str = "vote.review";

const PERSISTENT: u8 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Subject {
	Validation,
	Aggregation,
	Review,
}

impl Subject {
	pub fn queue_name(&self) -> &'static str {
		match self {
			Subject::Validation => "vote.validation",
			Subject::Aggregation => "vote.aggregation",
			Subject::Review => "vote.review",
		}
	}

	/// Binding pattern tying the queue to the topic exchange. Validation
	/// receives both the law and the election routing keys.
	pub fn binding_key(&self) -> &'static str {
		match self {
			Subject::Validation => "vote.validation.*",
			Subject::Aggregation => AGGREGATION_KEY,
			Subject::Review => REVIEW_KEY,
		}
	}

	fn bounded(&self) -> bool {
		// Review is the dead-letter target and must keep accepting what
		// the other queues shed.
		!matches!(self, Subject::Review)
	}
}

/// Publish seam for the stages, so handler and worker logic can be tested
/// without a broker.
#[async_trait]
pub trait BusPublisher: Send + Sync {
	async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<()>;
}

#[async_trait]
impl<T: BusPublisher + ?Sized> BusPublisher for std::sync::Arc<T> {
	async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<()> {
		(**self).publish(routing_key, payload).await
	}
}

#[derive(Clone)]
pub struct BusClient {
	// The connection must outlive the channel; dropping it tears the
	// socket down.
	connection: std::sync::Arc<Connection>,
	channel: Channel,
	confirm_timeout: Duration,
}

impl BusClient {
	/// Connect and declare the whole topology. Declaration is idempotent,
	/// so every component can run it at start-up regardless of ordering.
	pub async fn connect(settings: &settings::MessageBus) -> Result<Self> {
		let connection =
			Connection::connect(&settings.url, ConnectionProperties::default()).await?;
		let channel = connection.create_channel().await?;
		channel.confirm_select(ConfirmSelectOptions::default()).await?;

		channel
			.exchange_declare(
				EXCHANGE,
				ExchangeKind::Topic,
				ExchangeDeclareOptions { durable: true, ..Default::default() },
				FieldTable::default(),
			)
			.await?;

		for subject in [Subject::Validation, Subject::Aggregation, Subject::Review] {
			let mut arguments = FieldTable::default();
			if subject.bounded() {
				arguments
					.insert("x-max-length".into(), AMQPValue::LongUInt(settings.queue_max_length));
				arguments.insert("x-overflow".into(), AMQPValue::LongString("reject-publish".into()));
				arguments
					.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(EXCHANGE.into()));
				arguments.insert(
					"x-dead-letter-routing-key".into(),
					AMQPValue::LongString(REVIEW_KEY.into()),
				);
			}
			channel
				.queue_declare(
					subject.queue_name(),
					QueueDeclareOptions { durable: true, ..Default::default() },
					arguments,
				)
				.await?;
			channel
				.queue_bind(
					subject.queue_name(),
					EXCHANGE,
					subject.binding_key(),
					QueueBindOptions::default(),
					FieldTable::default(),
				)
				.await?;
		}

		Ok(Self {
			connection: std::sync::Arc::new(connection),
			channel,
			confirm_timeout: Duration::from_millis(settings.publish_confirm_timeout_ms),
		})
	}

	/// Whether the underlying channel is still usable; health reporting.
	pub fn is_connected(&self) -> bool {
		self.connection.status().connected() && self.channel.status().connected()
	}

	/// Manual-ack consumer with bounded prefetch. Deliveries must be acked
	/// or nacked individually by the caller.
	pub async fn consume(
		&self,
		subject: Subject,
		prefetch: u16,
		consumer_tag: &str,
	) -> Result<Consumer> {
		self.channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
		Ok(self
			.channel
			.basic_consume(
				subject.queue_name(),
				consumer_tag,
				BasicConsumeOptions::default(),
				FieldTable::default(),
			)
			.await?)
	}
}

#[async_trait]
impl BusPublisher for BusClient {
	/// A publish only succeeds once the broker confirms it; an unconfirmed
	/// or nacked publish is an error the caller maps to 503 or requeue.
	async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<()> {
		let confirmation = tokio::time::timeout(self.confirm_timeout, async {
			self.channel
				.basic_publish(
					EXCHANGE,
					routing_key,
					BasicPublishOptions::default(),
					&payload,
					BasicProperties::default().with_delivery_mode(PERSISTENT),
				)
				.await?
				.await
		})
		.await
		.map_err(|_| PipelineError::ConfirmTimeout)??;

		match confirmation {
			Confirmation::Nack(_) => Err(PipelineError::PublishNotConfirmed),
			Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
		}
	}
}

/// Per-delivery acknowledgment handle, abstracted so stage loops can be
/// tested without a broker.
#[async_trait]
pub trait MessageAck: Send {
	async fn ack(self) -> Result<()>;

	/// Negative-ack with requeue; the broker redelivers later.
	async fn requeue(self) -> Result<()>;

	/// Negative-ack without requeue; on the capped queues the broker
	/// dead-letters the payload to review.
	async fn reject(self) -> Result<()>;
}

pub struct DeliveryAck(pub Delivery);

#[async_trait]
impl MessageAck for DeliveryAck {
	async fn ack(self) -> Result<()> {
		Ok(self.0.ack(BasicAckOptions::default()).await?)
	}

	async fn requeue(self) -> Result<()> {
		Ok(self.0.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?)
	}

	async fn reject(self) -> Result<()> {
		Ok(self.0.nack(BasicNackOptions { requeue: false, ..Default::default() }).await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::settings::test_utils::new_test_settings;

	#[test]
	fn validation_queue_receives_both_ballot_kinds() {
		// Topic wildcard match: one queue, two routing keys.
		let pattern = Subject::Validation.binding_key();
		assert_eq!(pattern, "vote.validation.*");
		for key in [VALIDATION_LAW_KEY, VALIDATION_ELECTION_KEY] {
			let (prefix, _) = key.rsplit_once('.').unwrap();
			assert_eq!(format!("{prefix}.*"), pattern);
		}
	}

	#[test]
	fn review_queue_is_unbounded() {
		assert!(Subject::Validation.bounded());
		assert!(Subject::Aggregation.bounded());
		assert!(!Subject::Review.bounded());
	}

	#[tokio::test]
	#[ignore = "requires a running broker"]
	async fn publish_and_consume_round_trip() {
		use futures::StreamExt;

		let settings = new_test_settings().message_bus;
		let client = BusClient::connect(&settings).await.unwrap();
		client.publish(REVIEW_KEY, b"{}".to_vec()).await.unwrap();

		let mut consumer = client.consume(Subject::Review, 1, "mq-test").await.unwrap();
		let delivery = consumer.next().await.unwrap().unwrap();
		assert_eq!(delivery.data, b"{}");
		delivery.ack(Default::default()).await.unwrap();
	}
}
