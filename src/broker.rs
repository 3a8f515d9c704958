use crate::{
    config,
    dispatcher::{Broker, Dispatcher, Message, Poll, RunSummary},
};
use amiquip::{
    AmqpValue, Connection, Consumer, ConsumerMessage, ConsumerOptions, Delivery,
    ExchangeDeclareOptions, ExchangeType, FieldTable, QueueDeclareOptions,
};
use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// A consumer on one channel. Deliveries are parked here until the
/// dispatcher acknowledges them on this same thread.
struct AmqpSession<'a, 'c> {
    consumer: &'a Consumer<'c>,
    pending: HashMap<u64, Delivery>,
}

impl Broker for AmqpSession<'_, '_> {
    fn next_message(&mut self, timeout: Duration) -> Result<Poll> {
        match self.consumer.receiver().recv_timeout(timeout) {
            Ok(ConsumerMessage::Delivery(delivery)) => {
                let tag = delivery.delivery_tag();
                let body = delivery.body.clone();
                self.pending.insert(tag, delivery);
                Ok(Poll::Message(Message { tag, body }))
            }
            Ok(ConsumerMessage::ServerClosedChannel(err))
            | Ok(ConsumerMessage::ServerClosedConnection(err)) => {
                warn!(error = %err, "broker closed the consumer");
                Ok(Poll::Closed)
            }
            Ok(_) => {
                info!("consumer cancelled");
                Ok(Poll::Closed)
            }
            Err(err) if err.is_timeout() => Ok(Poll::Idle),
            Err(_) => Ok(Poll::Closed),
        }
    }

    fn ack(&mut self, tag: u64) -> Result<()> {
        let delivery = self
            .pending
            .remove(&tag)
            .ok_or_else(|| anyhow!("no pending delivery with tag {tag}"))?;
        self.consumer
            .ack(delivery)
            .with_context(|| format!("basic.ack {tag}"))
    }
}

/// Declares the durable exchange/queue pair, consumes with a prefetch of one
/// and hands deliveries to the dispatcher until the broker goes away.
pub fn consume_amqp(cfg: &config::Broker, dispatcher: &Dispatcher) -> Result<RunSummary> {
    info!(host = %cfg.host, port = cfg.port, queue = %cfg.queue, "connecting to broker");
    let mut connection = Connection::insecure_open(&cfg.url()?)
        .with_context(|| format!("connecting to amqp://{}:{}", cfg.host, cfg.port))?;
    let channel = connection
        .open_channel(None)
        .with_context(|| "opening channel")?;
    channel.qos(0, 1, false).with_context(|| "basic.qos")?;

    let exchange = channel
        .exchange_declare(
            ExchangeType::Fanout,
            cfg.exchange.clone(),
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
        )
        .with_context(|| format!("declaring exchange {}", cfg.exchange))?;

    let mut arguments = FieldTable::default();
    if !cfg.queue_type.is_empty() {
        arguments.insert(
            "x-queue-type".into(),
            AmqpValue::LongString(cfg.queue_type.clone().into()),
        );
    }
    let queue = channel
        .queue_declare(
            cfg.queue.clone(),
            QueueDeclareOptions {
                durable: true,
                arguments,
                ..QueueDeclareOptions::default()
            },
        )
        .with_context(|| format!("declaring queue {}", cfg.queue))?;
    queue
        .bind(&exchange, "", FieldTable::default())
        .with_context(|| "binding queue to exchange")?;

    let consumer = queue
        .consume(ConsumerOptions::default())
        .with_context(|| "basic.consume")?;
    info!(queue = %cfg.queue, "waiting for messages");

    let mut session = AmqpSession {
        consumer: &consumer,
        pending: HashMap::new(),
    };
    let summary = dispatcher.run(&mut session)?;
    if !session.pending.is_empty() {
        warn!(unacked = session.pending.len(), "closing with unacknowledged deliveries");
    }
    drop(session);
    drop(consumer);

    connection.close().with_context(|| "closing broker connection")?;
    Ok(summary)
}
