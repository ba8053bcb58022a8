mod common;

use common::{KEY, ms};
use delaycall::{
    DelayConfig, DispatchEvent, Dispatcher, MonitoredSink, OrderingScope, Request, SinkError,
    sink_fn,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::sleep;

// Cheap deterministic mixing so the traffic pattern is irregular but
// reproducible.
fn mix(i: u64, salt: u64) -> u64 {
    let mut x = i.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ salt;
    x ^= x >> 29;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^ (x >> 32)
}

#[tokio::test(start_paused = true)]
async fn single_key_executes_in_sequence_order() {
    const TOTAL: u64 = 300;

    let service = sink_fn(|req: Request| async move {
        sleep(ms(mix(req.sequence_id(), 7) % 50)).await;
        Ok::<(), SinkError>(())
    });
    let sink = Arc::new(MonitoredSink::new(service, OrderingScope::Global));
    let dispatcher = Dispatcher::new(DelayConfig::default(), Arc::clone(&sink)).unwrap();

    for i in 0..TOTAL {
        let delay = mix(i, 1) % 10 == 0;
        let request = Request::new(KEY, format!("task{i:03}"), i).with_delay(delay);
        dispatcher.handle(request).await.unwrap();
        sleep(ms(mix(i, 3) % 200)).await;
    }

    dispatcher.shutdown().await.unwrap();
    sink.verify().unwrap();
    assert_eq!(sink.observed(), TOTAL);
    assert!(dispatcher.stats().spawned > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn per_key_order_holds_under_contention() {
    const TOTAL: u64 = 2000;
    const KEYS: u64 = 4;

    let service = sink_fn(|req: Request| async move {
        if mix(req.sequence_id(), 11) % 4 == 0 {
            tokio::task::yield_now().await;
        }
        Ok::<(), SinkError>(())
    });
    let sink = Arc::new(MonitoredSink::new(service, OrderingScope::PerKey));
    let config = DelayConfig {
        window: ms(1),
        queue_capacity: 8,
        event_capacity: 16_384,
        ..DelayConfig::default()
    };
    let dispatcher = Dispatcher::new(config, Arc::clone(&sink)).unwrap();
    let mut events = dispatcher.subscribe();

    let collector = tokio::spawn(async move {
        let mut live: HashMap<String, u64> = HashMap::new();
        let mut executed = 0;
        while let Ok(event) = events.recv().await {
            match event {
                DispatchEvent::WorkerSpawned { key, generation } => {
                    assert!(
                        live.insert(key, generation).is_none(),
                        "two workers active for one key"
                    );
                }
                DispatchEvent::WorkerRetired {
                    key, generation, ..
                } => {
                    assert_eq!(live.remove(&key), Some(generation));
                }
                DispatchEvent::Executed(_) => executed += 1,
            }
        }
        (executed, live.len())
    });

    for i in 0..TOTAL {
        let key = format!("user{}", mix(i, 5) % KEYS);
        let delay = mix(i, 9) % 7 == 0;
        dispatcher
            .handle(Request::new(key, "payload", i).with_delay(delay))
            .await
            .unwrap();
        if mix(i, 13) % 16 == 0 {
            sleep(ms(2)).await;
        }
    }

    dispatcher.shutdown().await.unwrap();
    sink.verify().unwrap();
    assert_eq!(sink.observed(), TOTAL);

    drop(dispatcher);
    let (executed, still_live) = collector.await.unwrap();
    assert_eq!(executed, TOTAL);
    assert_eq!(still_live, 0);
}
