use crate::sim::config::Source;
use anyhow::Context;
use core::time::Duration;
use delaycall::Request;
use futures::StreamExt;
use futures::stream::BoxStream;
use rand::Rng;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Buffer between the producer task and the dispatcher.
const SOURCE_BUFFER: usize = 100;

pub async fn open(source: &Source) -> anyhow::Result<BoxStream<'static, Request>> {
    match source {
        Source::Random {
            requests,
            keys,
            delay_one_in,
            max_gap,
        } => Ok(random(*requests, *keys, *delay_one_in, *max_gap)),
        Source::File(path) => file(path).await,
    }
}

/// Spawns a producer that emits `requests` requests with contiguous sequence
/// ids from 0, spread across `keys` keys, pausing up to `max_gap` between
/// them. The producer stops early once the returned stream is dropped.
pub fn random(
    requests: u64,
    keys: u64,
    delay_one_in: u32,
    max_gap: Duration,
) -> BoxStream<'static, Request> {
    let (tx, rx) = mpsc::channel(SOURCE_BUFFER);
    let max_gap_ms = u64::try_from(max_gap.as_millis()).unwrap_or(u64::MAX);

    tokio::spawn(async move {
        for sequence_id in 0..requests {
            // `ThreadRng` is `!Send`; keep it out of the await points.
            let (key, delay, gap) = {
                let mut rng = rand::rng();
                let key = rng.random_range(1..=keys);
                let delay = rng.random_ratio(1, delay_one_in);
                let gap = rng.random_range(0..=max_gap_ms);
                (key, delay, gap)
            };

            let request = Request::new(
                format!("user{key}"),
                format!("task{sequence_id:03}"),
                sequence_id,
            )
            .with_delay(delay);

            if tx.send(request).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(gap)).await;
        }
    });

    ReceiverStream::new(rx).boxed()
}

/// Reads a JSON-lines request file. Blank lines are skipped.
pub async fn file(path: &Path) -> anyhow::Result<BoxStream<'static, Request>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let requests = parse_lines(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    Ok(futures::stream::iter(requests).boxed())
}

fn parse_lines(contents: &str) -> anyhow::Result<Vec<Request>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<Request>(line)
                .with_context(|| format!("line {}: invalid request", idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_lines() {
        let input = r#"
{"key":"user1","payload":"task000","sequence_id":0,"delay":true}

{"key":"user1","payload":"task001","sequence_id":1}
"#;
        let requests = parse_lines(input).unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].is_delayed());
        assert!(!requests[1].is_delayed());
        assert_eq!(requests[1].payload(), "task001");
    }

    #[test]
    fn reports_offending_line() {
        let input = "{\"key\":\"user1\",\"payload\":\"a\",\"sequence_id\":0}\nnot json\n";
        let err = parse_lines(input).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn random_source_emits_contiguous_ids() {
        let requests: Vec<Request> = random(50, 3, 10, Duration::from_millis(20))
            .collect()
            .await;

        assert_eq!(requests.len(), 50);
        for (expected, request) in requests.iter().enumerate() {
            assert_eq!(request.sequence_id(), expected as u64);
            assert!(["user1", "user2", "user3"].contains(&request.key()));
        }
        assert_eq!(requests[7].payload(), "task007");
    }
}
