//! Dma-buf feedback renegotiation
//!
//! When a client buffer keeps failing to reach a plane because of its
//! format or modifier, the client is told which formats the planes accept
//! by adding a scanout tranche to its feedback. When the view can never be
//! scanned out the tranche is removed again. Both directions are debounced,
//! so transient planning failures do not make clients reallocate.

use std::time::{Duration, Instant};

use tracing::debug;

use super::FailureReasons;
use crate::backend::allocator::format::FormatSet;

/// Change to the scanout tranche of a view's feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrancheAction {
    /// Advertise the scanout formats
    AddScanoutTranche,
    /// Only advertise the renderer formats
    RemoveScanoutTranche,
}

impl TrancheAction {
    /// The action the failures of a frame ask for, if any
    pub fn wanted(reasons: FailureReasons) -> Option<Self> {
        if reasons.contains(FailureReasons::FORCE_RENDERER) {
            Some(TrancheAction::RemoveScanoutTranche)
        } else if reasons.intersects(
            FailureReasons::ADD_FB_FAILED
                | FailureReasons::FB_FORMAT_INCOMPATIBLE
                | FailureReasons::DMABUF_MODIFIER_INVALID,
        ) {
            Some(TrancheAction::AddScanoutTranche)
        } else {
            None
        }
    }
}

/// One preference group of a feedback
#[derive(Debug, Clone)]
pub struct Tranche {
    /// Format and modifier pairs of the group
    pub formats: FormatSet,
    /// Whether buffers of this group may be scanned out directly
    pub scanout: bool,
}

/// Feedback to resend to the client, most preferred tranche first
#[derive(Debug, Clone)]
pub struct FeedbackUpdate {
    /// The tranches
    pub tranches: Vec<Tranche>,
}

/// Debounced scanout tranche state of one view
#[derive(Debug, Clone)]
pub struct ScanoutFeedback {
    renderer_formats: FormatSet,
    scanout_formats: FormatSet,
    scanout_active: bool,
    pending: Option<(TrancheAction, Instant)>,
    debounce: Duration,
}

impl ScanoutFeedback {
    /// Feedback advertising `renderer_formats` only.
    ///
    /// The scanout tranche, once added, lists the pairs of
    /// `scanout_formats` the renderer can also handle.
    pub fn new(renderer_formats: FormatSet, scanout_formats: FormatSet, debounce: Duration) -> Self {
        ScanoutFeedback {
            scanout_formats: scanout_formats.intersection(&renderer_formats),
            renderer_formats,
            scanout_active: false,
            pending: None,
            debounce,
        }
    }

    /// Whether the scanout tranche is advertised
    pub fn is_scanout_active(&self) -> bool {
        self.scanout_active
    }

    /// The action waiting for its debounce delay and when it was first wanted
    pub fn pending_action(&self) -> Option<(TrancheAction, Instant)> {
        self.pending
    }

    /// Feed the failures of one frame.
    ///
    /// Returns the new feedback once the same action was wanted for the
    /// whole debounce delay.
    pub fn maybe_update(&mut self, reasons: FailureReasons, now: Instant) -> Option<FeedbackUpdate> {
        let Some(action) = TrancheAction::wanted(reasons) else {
            self.pending = None;
            return None;
        };

        let active = action == TrancheAction::AddScanoutTranche;
        if active == self.scanout_active {
            self.pending = None;
            return None;
        }

        match self.pending {
            Some((pending, since)) if pending == action => {
                if now.saturating_duration_since(since) < self.debounce {
                    return None;
                }
            }
            _ => {
                self.pending = Some((action, now));
                return None;
            }
        }

        debug!(?action, "resending dma-buf feedback");
        self.scanout_active = active;
        self.pending = None;
        Some(FeedbackUpdate {
            tranches: self.tranches(),
        })
    }

    /// Current tranches, most preferred first
    pub fn tranches(&self) -> Vec<Tranche> {
        let mut tranches = Vec::with_capacity(2);
        if self.scanout_active && !self.scanout_formats.is_empty() {
            tranches.push(Tranche {
                formats: self.scanout_formats.clone(),
                scanout: true,
            });
        }
        tranches.push(Tranche {
            formats: self.renderer_formats.clone(),
            scanout: false,
        });
        tranches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::{Format, Fourcc, Modifier};

    fn formats(pairs: &[(Fourcc, Modifier)]) -> FormatSet {
        pairs
            .iter()
            .map(|(code, modifier)| Format {
                code: *code,
                modifier: *modifier,
            })
            .collect()
    }

    fn feedback() -> ScanoutFeedback {
        ScanoutFeedback::new(
            formats(&[
                (Fourcc::Argb8888, Modifier::Linear),
                (Fourcc::Xrgb8888, Modifier::Linear),
            ]),
            formats(&[(Fourcc::Xrgb8888, Modifier::Linear), (Fourcc::Nv12, Modifier::Linear)]),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn add_waits_for_the_debounce_delay() {
        let mut fb = feedback();
        let start = Instant::now();
        assert!(fb
            .maybe_update(FailureReasons::DMABUF_MODIFIER_INVALID, start)
            .is_none());
        assert_eq!(
            fb.pending_action(),
            Some((TrancheAction::AddScanoutTranche, start))
        );
        assert!(fb
            .maybe_update(FailureReasons::ADD_FB_FAILED, start + Duration::from_millis(1999))
            .is_none());

        let update = fb
            .maybe_update(FailureReasons::FB_FORMAT_INCOMPATIBLE, start + Duration::from_secs(2))
            .unwrap();
        assert!(fb.is_scanout_active());
        assert_eq!(fb.pending_action(), None);
        assert_eq!(update.tranches.len(), 2);
        assert!(update.tranches[0].scanout);
        assert_eq!(update.tranches[0].formats.len(), 1);
    }

    #[test]
    fn matching_state_clears_the_timer() {
        let mut fb = feedback();
        let start = Instant::now();
        fb.maybe_update(FailureReasons::FORCE_RENDERER, start);
        assert_eq!(fb.pending_action(), None);

        fb.maybe_update(FailureReasons::ADD_FB_FAILED, start);
        assert!(fb.pending_action().is_some());
        fb.maybe_update(FailureReasons::empty(), start + Duration::from_secs(1));
        assert_eq!(fb.pending_action(), None);
    }

    #[test]
    fn changing_want_restarts_the_timer() {
        let mut fb = feedback();
        let start = Instant::now();
        fb.maybe_update(FailureReasons::ADD_FB_FAILED, start);
        fb.maybe_update(FailureReasons::ADD_FB_FAILED, start + Duration::from_secs(3));
        assert!(fb.is_scanout_active());

        let later = start + Duration::from_secs(10);
        assert!(fb.maybe_update(FailureReasons::FORCE_RENDERER, later).is_none());
        assert!(fb
            .maybe_update(FailureReasons::DMABUF_MODIFIER_INVALID, later + Duration::from_secs(1))
            .is_none());
        assert_eq!(fb.pending_action(), None);

        fb.maybe_update(FailureReasons::FORCE_RENDERER, later + Duration::from_secs(2));
        let update = fb
            .maybe_update(FailureReasons::FORCE_RENDERER, later + Duration::from_secs(4))
            .unwrap();
        assert!(!fb.is_scanout_active());
        assert_eq!(update.tranches.len(), 1);
        assert!(!update.tranches[0].scanout);
    }

    #[test]
    fn force_renderer_wins_over_import_failures() {
        assert_eq!(
            TrancheAction::wanted(FailureReasons::FORCE_RENDERER | FailureReasons::ADD_FB_FAILED),
            Some(TrancheAction::RemoveScanoutTranche)
        );
        assert_eq!(TrancheAction::wanted(FailureReasons::GLOBAL_ALPHA), None);
    }
}
