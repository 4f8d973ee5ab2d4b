//! Heuristic content expansion before capture.
//!
//! Pages hide content behind accordions, "show more" controls, lazy panels,
//! and infinite scroll. [`ContentExpander`] reveals as much of it as it can
//! in a bounded number of rounds so the PDF serializes what a patient human
//! reader would have seen.
//!
//! Expansion is best-effort by contract: a round that errors (an element
//! detached mid-interaction, a script rejected by CSP) is skipped and logged
//! as a warning, never retried and never fatal.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::config::ExpandOptions;

use super::renderer::RenderSession;

/// Expansion strategies tried in sequence each round.
///
/// A fixed, tagged set keeps the termination logic in one place instead of
/// spreading it over open-ended dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionStrategy {
    /// Open `<details>`, accordions, `aria-expanded=false` widgets, and
    /// force-show collapsed containers.
    DisclosureWidgets,
    /// Click controls whose visible text reads "show more", "read more", etc.
    TextExpanders,
    /// Remove cookie banners, subscribe modals, and scroll-locking overlays.
    OverlayRemoval,
}

impl ExpansionStrategy {
    /// All strategies, in the order they are applied.
    pub const ALL: [Self; 3] = [
        Self::DisclosureWidgets,
        Self::TextExpanders,
        Self::OverlayRemoval,
    ];

    /// Strategy name used in warnings and logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::DisclosureWidgets => "disclosure-widgets",
            Self::TextExpanders => "text-expanders",
            Self::OverlayRemoval => "overlay-removal",
        }
    }

    /// The script run on the live page for this strategy.
    fn script(self) -> &'static str {
        match self {
            Self::DisclosureWidgets => DISCLOSURE_SCRIPT,
            Self::TextExpanders => TEXT_EXPANDER_SCRIPT,
            Self::OverlayRemoval => OVERLAY_REMOVAL_SCRIPT,
        }
    }
}

/// Mutable scratch tracking expansion progress across rounds.
///
/// The state makes expansion idempotent and bounded: a round that grows
/// neither the page height nor the DOM node count increments the stagnation
/// counter, and the loop stops at the stagnation threshold or the round cap,
/// whichever comes first.
#[derive(Debug, Clone)]
pub struct ExpansionState {
    rounds: u32,
    stagnant_rounds: u32,
    last_height: u64,
    last_node_count: u64,
    cumulative_scroll: u64,
    warnings: Vec<String>,
}

impl ExpansionState {
    /// Fresh state at the start of expansion.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rounds: 0,
            stagnant_rounds: 0,
            last_height: 0,
            last_node_count: 0,
            cumulative_scroll: 0,
            warnings: Vec::new(),
        }
    }

    /// Records one round's measurements and reports whether to continue.
    ///
    /// Returns `false` once the stagnation threshold or round cap is reached.
    pub fn record_round(&mut self, height: u64, node_count: u64, options: &ExpandOptions) -> bool {
        self.rounds += 1;
        if height == self.last_height && node_count == self.last_node_count {
            self.stagnant_rounds += 1;
        } else {
            self.stagnant_rounds = 0;
        }
        self.last_height = height;
        self.last_node_count = node_count;

        self.rounds < options.round_cap && self.stagnant_rounds < options.stagnation_threshold
    }

    /// Records a failed round; the round still counts against the cap.
    pub fn record_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Adds scrolled distance to the cumulative offset.
    pub fn add_scroll(&mut self, delta: u64) {
        self.cumulative_scroll += delta;
    }

    /// Number of expansion rounds performed.
    #[must_use]
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Final observed page height.
    #[must_use]
    pub fn final_height(&self) -> u64 {
        self.last_height
    }

    /// Total distance scrolled across all rounds.
    #[must_use]
    pub fn cumulative_scroll(&self) -> u64 {
        self.cumulative_scroll
    }

    /// Warnings gathered from failed rounds.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl Default for ExpansionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Reveals hidden and lazy content on a live [`RenderSession`].
#[derive(Debug, Default)]
pub struct ContentExpander {
    options: ExpandOptions,
}

impl ContentExpander {
    /// Creates an expander with the given options.
    #[must_use]
    pub fn new(options: ExpandOptions) -> Self {
        Self { options }
    }

    /// Runs the bounded expansion loop. Never fails; errors become warnings
    /// on the returned state.
    #[instrument(skip_all)]
    pub async fn expand(&self, session: &RenderSession) -> ExpansionState {
        let mut state = ExpansionState::new();

        loop {
            if let Err(warning) = self.run_round(session, &mut state).await {
                warn!(warning = %warning, round = state.rounds(), "Expansion round failed, skipping");
                state.record_warning(warning);
            }

            tokio::time::sleep(self.options.settle_delay).await;

            let (height, node_count) = match measure(session).await {
                Ok(measured) => measured,
                Err(warning) => {
                    // Measurement failure counts as stagnation; reuse the
                    // previous values so the loop still terminates.
                    state.record_warning(warning);
                    (state.last_height, state.last_node_count)
                }
            };

            if !state.record_round(height, node_count, &self.options) {
                break;
            }
        }

        debug!(
            rounds = state.rounds(),
            final_height = state.final_height(),
            warnings = state.warnings().len(),
            "Expansion finished"
        );
        state
    }

    /// One round: scroll to the bottom in human-like increments, then apply
    /// each strategy in order.
    async fn run_round(
        &self,
        session: &RenderSession,
        state: &mut ExpansionState,
    ) -> Result<(), String> {
        scroll_to_bottom(session, state).await?;

        for strategy in ExpansionStrategy::ALL {
            session
                .page()
                .evaluate(strategy.script())
                .await
                .map_err(|e| format!("{} strategy failed: {e}", strategy.name()))?;
        }
        Ok(())
    }
}

/// Scrolls to the bottom in randomized steps of 60-90% of the viewport with
/// randomized 400-900ms pauses. Fixed-cadence scrolling is what lazy-load
/// anti-bot heuristics key on.
async fn scroll_to_bottom(
    session: &RenderSession,
    state: &mut ExpansionState,
) -> Result<(), String> {
    let height: u64 = session
        .page()
        .evaluate("document.body.scrollHeight")
        .await
        .map_err(|e| format!("height probe failed: {e}"))?
        .into_value()
        .map_err(|e| format!("height probe returned non-numeric value: {e}"))?;

    let viewport = u64::from(session.viewport_height());
    let mut position: u64 = 0;

    while position < height {
        let (fraction, pause_ms) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0.6..=0.9), rng.gen_range(400..=900))
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let step = ((viewport as f64) * fraction) as u64;
        position = (position + step).min(height);
        state.add_scroll(step.min(height));

        session
            .page()
            .evaluate(format!(
                "window.scrollTo({{top: {position}, behavior: 'smooth'}})"
            ))
            .await
            .map_err(|e| format!("scroll failed: {e}"))?;
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
    }
    Ok(())
}

/// Measures page height and DOM node count for the stagnation check.
async fn measure(session: &RenderSession) -> Result<(u64, u64), String> {
    let measured: (u64, u64) = session
        .page()
        .evaluate(
            "(() => [document.body.scrollHeight, document.getElementsByTagName('*').length])()",
        )
        .await
        .map_err(|e| format!("measurement failed: {e}"))?
        .into_value()
        .map_err(|e| format!("measurement returned unexpected shape: {e}"))?;
    Ok(measured)
}

const DISCLOSURE_SCRIPT: &str = r#"(() => {
    const clickSelectors = [
        'details:not([open])',
        '.accordion:not(.active), .accordion:not(.show)',
        '.collapse-trigger, .expand-trigger',
        '[aria-expanded="false"]',
        '.dropdown-toggle, .dropdown-trigger',
        '.faq-question:not(.active), .faq-item:not(.active)'
    ];
    clickSelectors.forEach(selector => {
        document.querySelectorAll(selector).forEach(el => {
            try { el.click(); } catch (e) {}
        });
    });
    document.querySelectorAll('details').forEach(el => {
        el.setAttribute('open', 'true');
    });
    const showSelectors = [
        '.collapse:not(.show)',
        '.accordion-content',
        '.hidden-content',
        '[aria-hidden="true"]'
    ];
    showSelectors.forEach(selector => {
        document.querySelectorAll(selector).forEach(el => {
            el.style.display = 'block';
            el.style.visibility = 'visible';
            el.style.opacity = '1';
            el.style.height = 'auto';
            el.style.overflow = 'visible';
            el.setAttribute('aria-hidden', 'false');
            el.classList.add('active');
            el.classList.add('show');
            el.classList.remove('hidden');
            el.classList.remove('collapsed');
        });
    });
    document.querySelectorAll('.truncated, .clamp, .line-clamp').forEach(el => {
        el.style.maxHeight = 'none';
        el.style.webkitLineClamp = 'unset';
        el.style.display = 'block';
        el.style.overflow = 'visible';
    });
})()"#;

const TEXT_EXPANDER_SCRIPT: &str = r"(() => {
    const candidates = Array.from(document.querySelectorAll('button, a, span, div'))
        .filter(el => {
            const text = (el.textContent || '').toLowerCase();
            return text.includes('show more') ||
                   text.includes('read more') ||
                   text.includes('view more') ||
                   text.includes('see all');
        });
    candidates.forEach(el => {
        try { el.click(); } catch (e) {}
    });
})()";

const OVERLAY_REMOVAL_SCRIPT: &str = r#"(() => {
    const overlaySelectors = [
        '.modal-backdrop', '.overlay', '.popup-overlay', '.modal-overlay',
        'div[class*="overlay"]', 'div[id*="overlay"]',
        '.subscription-popup', '.subscribe-popup', '.newsletter-popup',
        'div[class*="newsletter"]', 'div[class*="paywall"]',
        '.cookie-banner', '.cookie-dialog', '.cookie-consent',
        'div[class*="cookie"]', 'div[class*="gdpr"]', 'div[class*="consent"]',
        'div[role="dialog"]', 'div[aria-modal="true"]'
    ];
    const acceptButtons = document.querySelectorAll('button, a');
    for (const button of acceptButtons) {
        const text = (button.textContent || '').toLowerCase();
        if (text.includes('accept') || text.includes('agree') ||
            text.includes('got it') || text.includes('i understand')) {
            try { button.click(); break; } catch (e) {}
        }
    }
    overlaySelectors.forEach(selector => {
        document.querySelectorAll(selector).forEach(el => {
            try { el.remove(); } catch (e) { el.style.display = 'none'; }
        });
    });
    document.body.style.overflow = 'auto';
    document.body.style.position = 'static';
    document.documentElement.style.overflow = 'auto';
})()"#;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn options(round_cap: u32, stagnation_threshold: u32) -> ExpandOptions {
        ExpandOptions {
            round_cap,
            stagnation_threshold,
            settle_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_expansion_stops_at_stagnation_threshold() {
        let opts = options(10, 2);
        let mut state = ExpansionState::new();
        assert!(state.record_round(1000, 50, &opts));
        assert!(state.record_round(2000, 80, &opts));
        // Two unchanged rounds in a row hit the threshold.
        assert!(state.record_round(2000, 80, &opts));
        assert!(!state.record_round(2000, 80, &opts));
        assert_eq!(state.rounds(), 4);
    }

    #[test]
    fn test_expansion_bounded_on_infinite_scroll() {
        // Synthetic infinite scroll: the page grows every round, so
        // stagnation never triggers and only the cap stops the loop.
        let opts = options(10, 2);
        let mut state = ExpansionState::new();
        let mut height = 1000;
        let mut continued = true;
        let mut iterations = 0;
        while continued {
            height += 500;
            continued = state.record_round(height, height / 10, &opts);
            iterations += 1;
            assert!(iterations <= 10, "Expansion must stop at the round cap");
        }
        assert_eq!(state.rounds(), 10);
    }

    #[test]
    fn test_growth_resets_stagnation_counter() {
        let opts = options(10, 2);
        let mut state = ExpansionState::new();
        assert!(state.record_round(1000, 50, &opts));
        assert!(state.record_round(1000, 50, &opts)); // stagnant x1
        assert!(state.record_round(1500, 60, &opts)); // growth resets
        assert!(state.record_round(1500, 60, &opts)); // stagnant x1
        assert!(!state.record_round(1500, 60, &opts)); // stagnant x2
    }

    #[test]
    fn test_node_count_growth_alone_counts_as_progress() {
        // Lazy loaders can add nodes without changing scrollHeight.
        let opts = options(10, 2);
        let mut state = ExpansionState::new();
        assert!(state.record_round(1000, 50, &opts));
        assert!(state.record_round(1000, 70, &opts));
        assert_eq!(state.final_height(), 1000);
    }

    #[test]
    fn test_warnings_accumulate_in_order() {
        let mut state = ExpansionState::new();
        state.record_warning("first");
        state.record_warning("second");
        assert_eq!(state.warnings(), ["first", "second"]);
    }

    #[test]
    fn test_strategy_names_are_stable() {
        assert_eq!(ExpansionStrategy::ALL.len(), 3);
        assert_eq!(ExpansionStrategy::DisclosureWidgets.name(), "disclosure-widgets");
        assert_eq!(ExpansionStrategy::OverlayRemoval.name(), "overlay-removal");
    }
}
