//! Свойства реестра рассылки: каждый обработчик получает каждый элемент
//! ровно один раз, а итог рассылки отражает ошибки обработчиков.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use proptest::prelude::*;
use tokio::runtime::Runtime;

use busline::{callback, BusError, EnvelopeIn, EnvelopeOut, FanOut, HeaderValue, Headers};

const PROPTEST_CASES: u32 = 64;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: PROPTEST_CASES,
        .. ProptestConfig::default()
    })]

    /// N обработчиков дают ровно N вызовов; рассылка завершается ошибкой
    /// тогда и только тогда, когда ошибся хотя бы один, и ошибок столько же,
    /// сколько неудачных обработчиков.
    #[test]
    fn every_callback_sees_every_item(failing in proptest::collection::vec(any::<bool>(), 0..24)) {
        let rt = runtime();
        let _guard = rt.enter();
        let fanout = FanOut::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for fail in failing.iter().copied() {
            let calls = calls.clone();
            fanout.add(callback(move |n: u32| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        return Err(BusError::delivery(n));
                    }
                    Ok(())
                }
            }));
        }

        let result = rt.block_on(fanout.put(42).wait());
        let failed = failing.iter().filter(|f| **f).count();

        prop_assert_eq!(calls.load(Ordering::SeqCst), failing.len());
        match result {
            Ok(()) => prop_assert_eq!(failed, 0),
            Err(err) => prop_assert_eq!(err.errors().len(), failed),
        }
    }

    /// Удаление по дескрипторам в любом порядке, включая повторное,
    /// оставляет ровно не удалённые обработчики.
    #[test]
    fn removal_is_exact(total in 1usize..32, removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..48)) {
        let fanout = FanOut::<u32>::new();
        let handles: Vec<_> = (0..total)
            .map(|_| fanout.add(callback(|_| async { Ok(()) })))
            .collect();

        let mut removed = std::collections::HashSet::new();
        for index in removals {
            let i = index.index(total);
            let was_removed = fanout.remove(handles[i]);
            prop_assert_eq!(was_removed, removed.insert(i));
        }
        prop_assert_eq!(fanout.len(), total - removed.len());
    }
}

/// Тест проверяет, что медленный обработчик не задерживает быстрый: быстрый
/// завершается, пока медленный ещё работает.
#[tokio::test]
async fn test_slow_callback_does_not_block_fast_one() {
    let fanout = FanOut::<u32>::new();
    let (fast_tx, mut fast_rx) = tokio::sync::mpsc::unbounded_channel();
    let release = Arc::new(tokio::sync::Notify::new());

    {
        let release = release.clone();
        fanout.add(callback(move |_| {
            let release = release.clone();
            async move {
                release.notified().await;
                Ok(())
            }
        }));
    }
    fanout.add(callback(move |n| {
        let fast_tx = fast_tx.clone();
        async move {
            let _ = fast_tx.send(n);
            Ok(())
        }
    }));

    let pool = fanout.put(5);
    let fast = tokio::time::timeout(Duration::from_secs(1), fast_rx.recv())
        .await
        .expect("fast callback must not wait for the slow one");
    assert_eq!(fast, Some(5));

    let waiting = tokio::time::timeout(Duration::from_millis(50), pool.wait()).await;
    assert!(waiting.is_err(), "wait must cover the slow callback");

    release.notify_waiters();
}

/// Тест проверяет, что каждый обработчик получает собственную копию
/// сообщения с теми же заголовками, типом содержимого и телом.
#[tokio::test]
async fn test_envelope_copies_reach_every_callback() {
    let fanout = FanOut::<EnvelopeIn>::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for _ in 0..3 {
        let tx = tx.clone();
        fanout.add(callback(move |mut e: EnvelopeIn| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((
                    e.headers().get("X").cloned(),
                    e.content_type().map(str::to_string),
                    e.read(),
                ));
                Ok(())
            }
        }));
    }

    let mut out = EnvelopeOut::new();
    out.write(b"{\"a\":1}");
    out.set_headers(Headers::from_iter([("X", "1")]));
    out.set_content_type("application/json");
    fanout.put(EnvelopeIn::from(out)).wait().await.unwrap();

    for _ in 0..3 {
        let (header, content_type, payload) = rx.try_recv().unwrap();
        assert_eq!(header, Some(HeaderValue::Str("1".into())));
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(payload, Bytes::from_static(b"{\"a\":1}"));
    }
    assert!(rx.try_recv().is_err());
}

/// Тест проверяет, что рассылка без ожидания результата всё равно
/// доходит до обработчика.
#[tokio::test]
async fn test_put_without_wait_still_delivers() {
    let fanout = FanOut::<u32>::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    fanout.add(callback(move |n| {
        let tx = tx.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(n);
            Ok(())
        }
    }));

    drop(fanout.put(1));

    let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("callback must complete after the pool is dropped");
    assert_eq!(got, Some(1));
}
