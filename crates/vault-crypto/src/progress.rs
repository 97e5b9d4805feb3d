//! Cooperative cancellation and monotonic progress.
//!
//! A [`Monitor`] is threaded through every engine and file operation. The
//! engine calls [`Monitor::checkpoint`] once per chunk boundary and reports
//! progress after each chunk; nothing is checked mid-chunk.

use tokio_util::sync::CancellationToken;

use crate::error::{CipherError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Fraction of the run completed, in `[0, 1]`.
    Fraction(f32),
    /// Total length unknown; work is still advancing.
    Indeterminate,
}

impl Progress {
    pub fn fraction(self) -> Option<f32> {
        match self {
            Progress::Fraction(f) => Some(f),
            Progress::Indeterminate => None,
        }
    }
}

type Callback<'a> = Box<dyn FnMut(Progress) + Send + 'a>;

/// Cancellation flag plus progress sink for one run.
///
/// Reported fractions never decrease within a run.
pub struct Monitor<'a> {
    cancel: CancellationToken,
    callback: Option<Callback<'a>>,
    last: Option<f32>,
}

impl Default for Monitor<'_> {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl std::fmt::Debug for Monitor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl<'a> Monitor<'a> {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            callback: None,
            last: None,
        }
    }

    /// Never cancelled, reports nowhere.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl FnMut(Progress) + Send + 'a) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with `Cancelled` if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::warn!("cancellation observed at chunk boundary");
            return Err(CipherError::Cancelled);
        }
        Ok(())
    }

    /// Report `processed / total`, or an indeterminate tick if `total` is unknown.
    pub fn advance(&mut self, processed: u64, total: Option<u64>) {
        match total {
            Some(0) => self.report_fraction(1.0),
            Some(total) => self.report_fraction((processed as f64 / total as f64) as f32),
            None => self.indeterminate(),
        }
    }

    /// Clamp to `[0, 1]` and hold at the highest value seen so far.
    pub fn report_fraction(&mut self, fraction: f32) {
        let clamped = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let value = self.last.map_or(clamped, |last| last.max(clamped));
        self.last = Some(value);
        if let Some(cb) = self.callback.as_mut() {
            cb(Progress::Fraction(value));
        }
    }

    pub fn indeterminate(&mut self) {
        if let Some(cb) = self.callback.as_mut() {
            cb(Progress::Indeterminate);
        }
    }

    /// Final report of a successful run: exactly `1.0` when the total was known.
    pub fn finish(&mut self, total: Option<u64>) {
        if total.is_some() {
            self.report_fraction(1.0);
        }
    }

    /// Highest fraction reported so far.
    pub fn last_fraction(&self) -> Option<f32> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording() -> (Arc<Mutex<Vec<Progress>>>, impl FnMut(Progress) + Send) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |p| sink.lock().unwrap().push(p))
    }

    #[test]
    fn test_fraction_is_clamped_and_monotonic() {
        let (seen, cb) = recording();
        let mut monitor = Monitor::silent().on_progress(cb);

        monitor.advance(50, Some(100));
        monitor.report_fraction(0.2);
        monitor.advance(150, Some(100));
        monitor.report_fraction(-3.0);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Progress::Fraction(0.5),
                Progress::Fraction(0.5),
                Progress::Fraction(1.0),
                Progress::Fraction(1.0),
            ]
        );
    }

    #[test]
    fn test_unknown_total_is_indeterminate() {
        let (seen, cb) = recording();
        let mut monitor = Monitor::silent().on_progress(cb);
        monitor.advance(10, None);
        monitor.finish(None);
        assert_eq!(*seen.lock().unwrap(), vec![Progress::Indeterminate]);
    }

    #[test]
    fn test_empty_known_total_finishes_at_one() {
        let (seen, cb) = recording();
        let mut monitor = Monitor::silent().on_progress(cb);
        monitor.finish(Some(0));
        assert_eq!(*seen.lock().unwrap(), vec![Progress::Fraction(1.0)]);
    }

    #[test]
    fn test_checkpoint_observes_cancel() {
        let token = CancellationToken::new();
        let monitor = Monitor::new(token.clone());
        assert!(monitor.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(monitor.checkpoint(), Err(CipherError::Cancelled)));
    }
}
