//! Batch processor scheduling, retry and isolation behaviour.
mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use breakwater::{
    BatchConfig, BatchProcessor, ErrorAction, FailureDisposition, FetchError, InstantSleeper,
    ProcessOptions,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(max_concurrency: usize, batch_size: usize, retry_attempts: usize) -> BatchConfig {
    BatchConfig {
        max_concurrency,
        batch_size,
        retry_attempts,
        retry_delay: Duration::from_millis(50),
        inter_batch_pause: Duration::from_millis(100),
    }
}

fn processor(max_concurrency: usize, batch_size: usize, retry_attempts: usize) -> BatchProcessor {
    BatchProcessor::new(config(max_concurrency, batch_size, retry_attempts))
        .unwrap()
        .with_sleeper(InstantSleeper)
}

#[tokio::test]
async fn every_item_yields_exactly_one_outcome() {
    let items: Vec<String> = (0..37).map(|i| format!("https://example.org/doc/{i}")).collect();
    let report = processor(4, 8, 2)
        .process_items(
            items.clone(),
            |url| {
                let fails = url.ends_with('3');
                let len = url.len();
                async move {
                    if fails {
                        Err(format!("unreachable: {len}"))
                    } else {
                        Ok(len)
                    }
                }
            },
            "conservation",
        )
        .await;

    assert_eq!(report.total, 37);
    assert_eq!(report.successful + report.failed, report.total);
    assert_eq!(report.outcomes.len(), report.total);
    assert_eq!(report.batches, 5);
    for (i, outcome) in report.outcomes.iter().enumerate() {
        assert_eq!(outcome.index, i);
        assert_eq!(outcome.item, items[i]);
        assert_eq!(outcome.is_success(), !items[i].ends_with('3'));
        assert!(outcome.attempts >= 1 && outcome.attempts <= 2);
    }
    assert_eq!(report.failures().count(), 4);
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_the_limit() {
    for limit in [1usize, 2, 5, 16] {
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let processor = BatchProcessor::new(config(limit, 20, 1)).unwrap();

        let report = processor
            .process_items(
                (0..40).collect::<Vec<u32>>(),
                |_| {
                    let current = &current;
                    let peak = &peak;
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    }
                },
                "bound",
            )
            .await;

        assert_eq!(report.successful, 40);
        assert_eq!(peak.load(Ordering::SeqCst), limit, "limit {limit}");
    }
}

#[tokio::test]
async fn succeeds_on_third_attempt() {
    let calls: Mutex<HashMap<u32, usize>> = Mutex::new(HashMap::new());
    let report = processor(2, 10, 3)
        .process_items(
            vec![1u32, 2],
            |item| {
                let n = {
                    let mut calls = calls.lock().unwrap();
                    let n = calls.entry(*item).or_insert(0);
                    *n += 1;
                    *n
                };
                let item = *item;
                async move {
                    if item == 1 && n < 3 {
                        Err("transient")
                    } else {
                        Ok(item)
                    }
                }
            },
            "attempts",
        )
        .await;

    assert_eq!(report.outcomes[0].attempts, 3);
    assert_eq!(report.outcomes[0].result, Ok(1));
    assert_eq!(report.outcomes[1].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn batches_run_strictly_in_sequence() {
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Event {
        Start(usize),
        End(usize),
    }
    let log = Mutex::new(Vec::new());
    let processor = BatchProcessor::new(config(5, 10, 1)).unwrap();

    let report = processor
        .process_items(
            (0..25).collect::<Vec<usize>>(),
            |item| {
                let item = *item;
                let log = &log;
                async move {
                    log.lock().unwrap().push(Event::Start(item));
                    tokio::time::sleep(Duration::from_millis(5 + (item % 3) as u64)).await;
                    log.lock().unwrap().push(Event::End(item));
                    Ok::<_, String>(())
                }
            },
            "schedule",
        )
        .await;
    assert_eq!(report.batches, 3);

    let log = log.into_inner().unwrap();
    let position = |event: Event| log.iter().position(|e| *e == event).unwrap();
    for batch in 1..3 {
        let previous_done = ((batch - 1) * 10..batch * 10).map(|i| position(Event::End(i))).max();
        let first_start =
            (batch * 10..(batch * 10 + 10).min(25)).map(|i| position(Event::Start(i))).min();
        assert!(first_start > previous_done, "batch {batch} started early");
    }
}

#[tokio::test]
async fn one_bad_item_does_not_affect_the_rest() {
    let report = processor(5, 10, 3)
        .process_items(
            (0..25).collect::<Vec<u32>>(),
            |item| {
                let item = *item;
                async move {
                    if item == 7 {
                        Err(format!("item {item} is broken"))
                    } else {
                        Ok(item * 2)
                    }
                }
            },
            "isolation",
        )
        .await;

    assert_eq!(report.successful, 24);
    assert_eq!(report.failed, 1);
    let broken = &report.outcomes[7];
    assert_eq!(broken.item, 7);
    assert_eq!(broken.attempts, 3);
    let failure = broken.result.as_ref().unwrap_err();
    assert_eq!(failure.disposition, FailureDisposition::Exhausted);
    assert_eq!(failure.error, "item 7 is broken");
    assert_eq!(report.outcomes[8].result, Ok(16));
}

#[tokio::test]
async fn escalated_items_are_kept_in_the_report() {
    let options = ProcessOptions::new().on_error(|err: &String, _: &&str, _| {
        if err.contains("fatal") {
            ErrorAction::Fail
        } else {
            ErrorAction::Retry
        }
    });
    let report = processor(3, 10, 3)
        .process_items_with(
            vec!["a", "fatal-b", "c"],
            |item| {
                let item = *item;
                async move {
                    if item.starts_with("fatal") {
                        Err(format!("{item}: fatal parse error"))
                    } else {
                        Ok(item.len())
                    }
                }
            },
            "escalation",
            options,
        )
        .await;

    assert_eq!(report.successful, 2);
    let escalated = &report.outcomes[1];
    assert_eq!(escalated.item, "fatal-b");
    assert_eq!(escalated.attempts, 1);
    assert_eq!(
        escalated.result.as_ref().unwrap_err().disposition,
        FailureDisposition::Escalated
    );
    assert_eq!(report.into_failed_items(), vec!["fatal-b"]);
}

#[tokio::test]
async fn fetching_urls_through_the_client() {
    let server = MockServer::start().await;
    for i in 0..12 {
        let status = if i == 7 { 500 } else { 200 };
        Mock::given(method("GET"))
            .and(path(format!("/doc/{i}")))
            .respond_with(ResponseTemplate::new(status).set_body_string(format!("document number {i}")))
            .mount(&server)
            .await;
    }

    let client = common::client(2);
    let urls: Vec<String> = (0..12).map(|i| format!("{}/doc/{i}", server.uri())).collect();
    let processed = AtomicUsize::new(0);
    let options = ProcessOptions::<String, FetchError>::new()
        .classified()
        .on_progress(|_, _, _| {
            processed.fetch_add(1, Ordering::SeqCst);
        });
    let report = processor(4, 5, 1)
        .process_items_with(
            urls,
            |url| {
                let client = client.clone();
                let url = url.clone();
                async move { client.get_text(&url).await.map_err(|e| e.last_error().cloned().unwrap()) }
            },
            "docs",
            options,
        )
        .await;

    assert_eq!(processed.load(Ordering::SeqCst), 12);
    assert_eq!(report.successful, 11);
    assert_eq!(report.outcomes[3].result.as_deref(), Ok("document number 3"));
    let failure = report.outcomes[7].result.as_ref().unwrap_err();
    assert_eq!(failure.error.status(), Some(500));
}
