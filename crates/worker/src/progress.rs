/// Number of progress buckets per file (5 % each).
const STEPS: f64 = 20.0;

/// Lets a progress update through at most once per 5 % step.
///
/// The first update (normally 0 %) and the final one (100 %) always pass.
#[derive(Debug, Default)]
pub(crate) struct ProgressGate {
    last_step: Option<u32>,
}

impl ProgressGate {
    pub(crate) fn admit(&mut self, fraction: f64) -> bool {
        let step = (fraction.clamp(0.0, 1.0) * STEPS).floor() as u32;
        match self.last_step {
            Some(last) if step <= last => false,
            _ => {
                self.last_step = Some(step);
                true
            }
        }
    }
}

pub(crate) fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}
