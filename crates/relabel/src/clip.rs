//! Window clipping.
//!
//! Range queries may return boundary-adjacent samples depending on how the
//! store aligns its range. This filter is the only place that decides
//! whether a sample lies inside the window.

use futures::{Stream, TryStreamExt, future};

use crate::error::StoreError;
use crate::models::{Sample, Window};

/// Drop samples strictly before `start` or strictly after `end`
pub fn clip_window<S>(samples: S, window: Window) -> impl Stream<Item = Result<Sample, StoreError>>
where
    S: Stream<Item = Result<Sample, StoreError>>,
{
    samples.try_filter(move |sample| future::ready(window.contains(sample.timestamp)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use futures::stream;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    async fn clipped(timestamps: &[DateTime<Utc>], window: Window) -> Vec<DateTime<Utc>> {
        let samples = stream::iter(
            timestamps
                .iter()
                .map(|t| Ok(Sample::new(*t, 1.0)))
                .collect::<Vec<_>>(),
        );
        clip_window(samples, window)
            .map_ok(|s| s.timestamp)
            .try_collect()
            .await
            .expect("no errors in input")
    }

    #[tokio::test]
    async fn test_drops_overfetch_on_both_edges() {
        let window = Window::new(at(10), at(30)).expect("valid window");
        let input = [
            at(10) - Duration::nanoseconds(1),
            at(10),
            at(20),
            at(30),
            at(30) + Duration::nanoseconds(1),
            at(40),
        ];
        assert_eq!(clipped(&input, window).await, vec![at(10), at(20), at(30)]);
    }

    #[tokio::test]
    async fn test_keeps_everything_inside() {
        let window = Window::new(at(0), at(100)).expect("valid window");
        let input: Vec<_> = (0..=100).step_by(7).map(at).collect();
        assert_eq!(clipped(&input, window).await, input);
    }

    #[tokio::test]
    async fn test_point_window() {
        let window = Window::new(at(20), at(20)).expect("valid window");
        assert_eq!(clipped(&[at(19), at(20), at(21)], window).await, vec![at(20)]);
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let window = Window::new(at(0), at(10)).expect("valid window");
        let samples = stream::iter(vec![
            Ok(Sample::new(at(1), 1.0)),
            Err(StoreError::Protocol("truncated".to_string())),
        ]);
        let result: Result<Vec<Sample>, _> = clip_window(samples, window).try_collect().await;
        assert!(matches!(result, Err(StoreError::Protocol(_))));
    }
}
