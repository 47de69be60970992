use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::mpsc;

use busline::{
    binding::{AmqpChannelBindings, ExchangeBindings, ExchangeKind, QueueBindings},
    callback,
    transport::amqp::{AmqpConsumer, AmqpProducer, MemoryBroker},
    BusError, Cancel, EnvelopeIn, EnvelopeOut, HeaderValue, Headers, Publisher, Subscriber,
};

const DEADLINE: Duration = Duration::from_secs(5);

fn envelope(payload: &str) -> EnvelopeOut {
    let mut e = EnvelopeOut::new();
    e.write(payload.as_bytes());
    e
}

/// Ждёт выполнения условия, опрашивая его до истечения срока.
async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(DEADLINE, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

/// Тест проверяет, что заголовок, тип содержимого и тело доходят до
/// обработчика подписчика без изменений.
#[tokio::test]
async fn test_round_trip_preserves_metadata() {
    let broker = MemoryBroker::new().with_queue("orders");
    let producer = AmqpProducer::new(Arc::new(broker.clone()));
    let consumer = AmqpConsumer::new(Arc::new(broker.clone()));

    let subscriber = consumer.open("orders", None).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = Cancel::new();
    let receive = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let cb = callback(move |mut e: EnvelopeIn| {
                let tx = tx.clone();
                async move {
                    let payload = e.read();
                    let _ = tx.send((e.headers().clone(), e.content_type().map(str::to_string), payload));
                    Ok(())
                }
            });
            subscriber.receive(cb, &cancel).await
        })
    };

    let publisher = producer.open("orders", None).await.unwrap();
    let mut out = envelope("{\"a\":1}");
    out.set_headers(Headers::from_iter([("X", "1")]));
    out.set_content_type("application/json");
    publisher.send(vec![out]).await.unwrap();

    let (headers, content_type, payload) = tokio::time::timeout(DEADLINE, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(headers.get("X"), Some(&HeaderValue::Str("1".into())));
    assert_eq!(headers.len(), 1);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    assert_eq!(payload, Bytes::from_static(b"{\"a\":1}"));

    eventually(|| broker.stats("orders").is_some_and(|s| s.acked == 1)).await;

    cancel.cancel();
    let result = receive.await.unwrap();
    assert!(result.unwrap_err().is_cancelled());
}

/// Тест проверяет, что ошибка второго сообщения из трёх возвращается
/// одна, а первое и третье опубликованы.
#[tokio::test]
async fn test_batch_with_one_failure() {
    let broker = MemoryBroker::new().with_queue("orders");
    broker.reject_publishes_where(|_, message| message.payload.as_ref() == b"2");
    let producer = AmqpProducer::new(Arc::new(broker.clone()));
    let publisher = producer.open("orders", None).await.unwrap();

    let err = publisher
        .send(vec![envelope("1"), envelope("2"), envelope("3")])
        .await
        .unwrap_err();
    assert_eq!(err.errors().len(), 1);
    assert!(matches!(err.errors()[0], BusError::Delivery { .. }));

    let mut sent: Vec<_> = broker
        .published()
        .into_iter()
        .map(|p| p.message.payload)
        .collect();
    sent.sort();
    assert_eq!(sent, vec![Bytes::from_static(b"1"), Bytes::from_static(b"3")]);
}

/// Тест проверяет close-on-error: конфликт объявления возвращается
/// вызывающему, а открытый канал закрывается.
#[tokio::test]
async fn test_declare_conflict_closes_channel() {
    let broker = MemoryBroker::new().with_exchange("events", ExchangeKind::Direct);
    let producer = AmqpProducer::new(Arc::new(broker.clone()));
    let bindings = AmqpChannelBindings::default().with_exchange(ExchangeBindings {
        name: Some("events".into()),
        kind: Some(ExchangeKind::Fanout),
        durable: Some(true),
        ..Default::default()
    });

    let err = producer.open("orders", Some(bindings)).await.unwrap_err();
    assert!(matches!(err, BusError::Declare { .. }), "got: {err}");
    assert_eq!(broker.open_channels(), 0);
}

/// Тест проверяет, что пустая конфигурация ничего не объявляет, а
/// конфигурация с `durable` объявляет очередь.
#[tokio::test]
async fn test_declare_only_when_configured() {
    let broker = MemoryBroker::new();
    let consumer = AmqpConsumer::new(Arc::new(broker.clone()));

    let err = consumer.open("orders", None).await.unwrap_err();
    assert!(matches!(err, BusError::Connection { .. }), "got: {err}");
    assert!(!broker.has_queue("orders"));
    assert_eq!(broker.open_channels(), 0);

    let bindings = AmqpChannelBindings::default().with_queue(QueueBindings {
        durable: Some(true),
        ..Default::default()
    });
    let subscriber = consumer.open("orders", Some(bindings)).await.unwrap();
    assert!(broker.has_queue("orders"));
    assert_eq!(broker.consumer_count("orders"), 1);
    subscriber.close().await.unwrap();
    eventually(|| broker.consumer_count("orders") == 0).await;
}

/// Тест проверяет подтверждения: успех подтверждается, ошибка обработчика
/// отклоняется без возврата в очередь.
#[tokio::test]
async fn test_ack_and_nack_follow_callback_result() {
    let broker = MemoryBroker::new().with_queue("jobs");
    let producer = AmqpProducer::new(Arc::new(broker.clone()));
    let consumer = AmqpConsumer::new(Arc::new(broker.clone()));
    let subscriber = consumer.open("jobs", None).await.unwrap();

    let cancel = Cancel::new();
    let receive = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let cb = callback(|mut e: EnvelopeIn| async move {
                if e.read().as_ref() == b"bad" {
                    return Err(BusError::delivery("cannot process"));
                }
                Ok(())
            });
            subscriber.receive(cb, &cancel).await
        })
    };

    let publisher = producer.open("jobs", None).await.unwrap();
    publisher.send(vec![envelope("good")]).await.unwrap();
    publisher.send(vec![envelope("bad")]).await.unwrap();

    eventually(|| {
        broker
            .stats("jobs")
            .is_some_and(|s| s.acked == 1 && s.nacked == 1 && s.ready == 0)
    })
    .await;

    cancel.cancel();
    let _ = receive.await.unwrap();
}

/// Тест проверяет автоподтверждение: результат обработчика не влияет на
/// брокер.
#[tokio::test]
async fn test_auto_ack_ignores_callback_result() {
    let broker = MemoryBroker::new().with_queue("jobs");
    let producer = AmqpProducer::new(Arc::new(broker.clone()));
    let consumer = AmqpConsumer::new(Arc::new(broker.clone()));
    let bindings = AmqpChannelBindings::default().with_ack(false);
    let subscriber = consumer.open("jobs", Some(bindings)).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = Cancel::new();
    let receive = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let cb = callback(move |_e: EnvelopeIn| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(());
                    Err(BusError::delivery("ignored"))
                }
            });
            subscriber.receive(cb, &cancel).await
        })
    };

    let publisher = producer.open("jobs", None).await.unwrap();
    publisher.send(vec![envelope("x")]).await.unwrap();
    tokio::time::timeout(DEADLINE, rx.recv()).await.unwrap().unwrap();

    let stats = broker.stats("jobs").unwrap();
    assert_eq!(stats.nacked, 0);
    assert_eq!(stats.ready, 0);

    cancel.cancel();
    let _ = receive.await.unwrap();
}

/// Тест проверяет, что заблокированный `receive` возвращает ошибку отмены
/// вскоре после сигнала.
#[tokio::test]
async fn test_receive_returns_promptly_on_cancel() {
    let broker = MemoryBroker::new().with_queue("idle");
    let consumer = AmqpConsumer::new(Arc::new(broker.clone()));
    let subscriber = consumer.open("idle", None).await.unwrap();

    let cancel = Cancel::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel_with("test is done");
    });

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        subscriber.receive(callback(|_e: EnvelopeIn| async { Ok(()) }), &cancel),
    )
    .await
    .expect("receive did not return after cancellation");
    match result {
        Err(BusError::Cancelled { cause }) => assert_eq!(cause.as_deref(), Some("test is done")),
        other => panic!("unexpected result: {other:?}"),
    }
}

/// Тест проверяет, что обрыв потока доставок останавливает канал и
/// `receive` возвращает ошибку соединения.
#[tokio::test]
async fn test_lost_consumer_fails_receive() {
    let broker = MemoryBroker::new().with_queue("orders");
    let consumer = AmqpConsumer::new(Arc::new(broker.clone()));
    let subscriber = consumer.open("orders", None).await.unwrap();
    let cancel = Cancel::new();

    let receive = subscriber.receive(callback(|_e: EnvelopeIn| async { Ok(()) }), &cancel);
    let drop_consumers = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.drop_consumers();
    };
    let (result, ()) = tokio::time::timeout(DEADLINE, async { tokio::join!(receive, drop_consumers) })
        .await
        .unwrap();
    let err = result.unwrap_err();
    assert!(!err.is_cancelled(), "got: {err}");
}

/// Тест проверяет, что зависший обработчик одного подписчика не мешает
/// другому подписчику канала получать следующие сообщения.
#[tokio::test]
async fn test_stuck_subscriber_does_not_block_siblings() {
    let broker = MemoryBroker::new().with_queue("orders");
    let producer = AmqpProducer::new(Arc::new(broker.clone()));
    let consumer = AmqpConsumer::new(Arc::new(broker.clone()));
    let stuck = consumer.open("orders", None).await.unwrap();
    let fast = consumer.open("orders", None).await.unwrap();
    let topic = Arc::clone(fast.topic());

    let cancel = Cancel::new();
    let stuck_receive = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let cb = callback(|_e: EnvelopeIn| futures::future::pending());
            stuck.receive(cb, &cancel).await
        })
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let fast_receive = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let cb = callback(move |mut e: EnvelopeIn| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(e.read());
                    Ok(())
                }
            });
            fast.receive(cb, &cancel).await
        })
    };
    // Оба обработчика должны быть зарегистрированы до публикации.
    eventually(|| topic.fanout().len() == 2).await;

    let publisher = producer.open("orders", None).await.unwrap();
    publisher.send(vec![envelope("first")]).await.unwrap();
    publisher.send(vec![envelope("second")]).await.unwrap();

    let mut got = Vec::new();
    for _ in 0..2 {
        got.push(tokio::time::timeout(DEADLINE, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(
        got,
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );

    cancel.cancel();
    let _ = fast_receive.await.unwrap();
    let _ = stuck_receive.await.unwrap();
}
