//! Coarse directional search, tail check and step refinement.
//!
//! # States
//!
//! ```text
//! Seed --> GoingUp <--> GoingDown --> Tail check --accept--> Refine --> Operating height
//!             \______________/  reject: mark noise, turn around
//! ```
//!
//! During the coarse phase the trace stays sorted by z: upward extensions and
//! tail samples go above the highest sample, downward extensions below the
//! lowest. Samples marked as noise are skipped when a tail is checked. Two
//! turnarounds in a row without a new extension sample means the walk is
//! bouncing between the trace ends, so the best remaining interior sample is
//! checked directly.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{FocusResult, FocusTrace};
use crate::cancel::{CancellationToken, Halt};
use crate::config::AutofocusConfig;
use crate::error::{RigError, RigResult};
use crate::events::{Outcome, ProgressEvent, ProgressSender};
use crate::geometry::Pose;
use crate::guard::restore_reference;
use crate::hardware::Rig;
use crate::storage::{NullStore, ResultsStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn reversed(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// Position of the best score inside the three-sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowPeak {
    Left,
    Middle,
    Right,
}

/// What the coarse loop does after inspecting the window.
enum Step {
    Extend,
    Turn,
    Accept(f64),
}

/// Autofocus engine bound to one rig.
pub struct FocusSearch {
    rig: Rig,
    config: AutofocusConfig,
    store: Arc<dyn ResultsStore>,
    events: ProgressSender,
}

impl FocusSearch {
    /// Validates `config` before any hardware is touched.
    pub fn new(rig: Rig, config: AutofocusConfig) -> RigResult<Self> {
        config.validate()?;
        Ok(Self {
            rig,
            config,
            store: Arc::new(NullStore),
            events: ProgressSender::disabled(),
        })
    }

    /// Persist the trace through `store` at the end of each run.
    pub fn with_store(mut self, store: Arc<dyn ResultsStore>) -> Self {
        self.store = store;
        self
    }

    /// Report samples and the terminal event through `events`.
    pub fn with_events(mut self, events: ProgressSender) -> Self {
        self.events = events;
        self
    }

    /// Find the in-focus height above the current pose.
    ///
    /// On success the manipulator is left at the operating height. On failure
    /// or cancellation it is returned to the pose it started from.
    pub async fn run(&self, cancel: &CancellationToken) -> RigResult<Outcome<FocusResult>> {
        let result = self.search(cancel).await;
        self.events.finish(&result);
        result
    }

    async fn search(&self, cancel: &CancellationToken) -> RigResult<Outcome<FocusResult>> {
        let motion = self.rig.motion.as_ref();
        let reference = motion.position().await?;
        info!(%reference, step = self.config.step_size_um, "starting focus search");

        let mut run = SearchRun {
            rig: &self.rig,
            config: &self.config,
            events: &self.events,
            cancel,
            reference,
            trace: FocusTrace::default(),
            noise: Vec::new(),
            iterations: 0,
        };

        match run.locate().await {
            Ok(result) => {
                self.store.save_focus_trace(&run.trace)?;
                info!(z = result.z, operating_z = result.operating_z, "focus found");
                Ok(Outcome::Completed(result))
            }
            Err(Halt::Cancelled) => {
                restore_reference(motion, reference, Ok(())).await?;
                self.store.save_focus_trace(&run.trace)?;
                info!(samples = run.trace.len(), "focus search cancelled");
                Ok(Outcome::Cancelled { partial: None })
            }
            Err(Halt::Failed(err)) => {
                warn!(error = %err, samples = run.trace.len(), "focus search failed");
                restore_reference(motion, reference, Err(err)).await
            }
        }
    }
}

/// Mutable state of a single search.
struct SearchRun<'a> {
    rig: &'a Rig,
    config: &'a AutofocusConfig,
    events: &'a ProgressSender,
    cancel: &'a CancellationToken,
    reference: Pose,
    trace: FocusTrace,
    /// Parallel to the coarse trace: rejected candidates and isolated samples.
    noise: Vec<bool>,
    iterations: usize,
}

impl SearchRun<'_> {
    async fn locate(&mut self) -> Result<FocusResult, Halt> {
        let coarse = self.coarse_peak().await?;
        let z = self.refine(coarse).await?;
        let operating_z = z - self.config.focus_bias_um;
        self.rig
            .motion
            .move_absolute(self.reference.with_z(operating_z))
            .await?;
        Ok(FocusResult { z, operating_z })
    }

    async fn coarse_peak(&mut self) -> Result<f64, Halt> {
        let step = self.config.step_size_um;
        for k in 1..=3 {
            self.sample_above(self.reference.z + k as f64 * step).await?;
        }

        let mut direction = Direction::Up;
        let mut turn_pending = false;
        loop {
            self.iterations += 1;
            if self.iterations > self.config.max_iterations {
                return Err(self.not_found(self.furthest_excursion()));
            }

            match self.decide(direction).await? {
                Step::Accept(z) => return Ok(z),
                Step::Extend => {
                    match direction {
                        Direction::Up => self.sample_above(self.top() + step).await?,
                        Direction::Down => self.sample_below(self.bottom() - step).await?,
                    };
                    turn_pending = false;
                }
                Step::Turn => {
                    direction = direction.reversed();
                    debug!(?direction, iteration = self.iterations, "turning around");
                    if !turn_pending {
                        turn_pending = true;
                        continue;
                    }
                    turn_pending = false;
                    if let Some(z) = self.resolve_interior().await? {
                        return Ok(z);
                    }
                }
            }
        }
    }

    async fn decide(&mut self, direction: Direction) -> Result<Step, Halt> {
        let n = self.trace.len();
        let step = match (direction, self.window_peak(direction)) {
            (Direction::Up, WindowPeak::Right) | (Direction::Down, WindowPeak::Left) => {
                Step::Extend
            }
            (Direction::Up, WindowPeak::Left) | (Direction::Down, WindowPeak::Right) => Step::Turn,
            (Direction::Up, WindowPeak::Middle) => {
                let candidate = n - 2;
                if self.is_leading(candidate) {
                    self.check_or_reject(candidate).await?
                } else {
                    Step::Turn
                }
            }
            (Direction::Down, WindowPeak::Middle) => {
                if self.noise[1] {
                    Step::Turn
                } else {
                    self.check_or_reject(1).await?
                }
            }
        };
        Ok(step)
    }

    async fn check_or_reject(&mut self, candidate: usize) -> Result<Step, Halt> {
        if self.tail_declines(candidate).await? {
            return self.accept(candidate).await.map(Step::Accept);
        }
        self.noise[candidate] = true;
        Ok(Step::Turn)
    }

    /// Check the best interior sample left after the walk stopped making progress.
    ///
    /// Besides a declining tail, the candidate has to score strictly above the
    /// nearest non-noise sample below it.
    async fn resolve_interior(&mut self) -> Result<Option<f64>, Halt> {
        let Some(candidate) = self.best_candidate() else {
            return Err(self.not_found(self.furthest_excursion()));
        };
        debug!(z = self.trace.positions()[candidate], "resolving interior candidate");
        if self.tail_declines(candidate).await? && self.beats_sample_below(candidate) {
            return self.accept(candidate).await.map(Some);
        }
        self.noise[candidate] = true;
        Ok(None)
    }

    async fn accept(&mut self, candidate: usize) -> Result<f64, Halt> {
        let z = self.trace.positions()[candidate];
        self.rig
            .motion
            .move_absolute(self.reference.with_z(z))
            .await?;
        info!(z, iterations = self.iterations, "coarse peak accepted");
        Ok(z)
    }

    /// Check that scores do not increase from `candidate` upward.
    ///
    /// The tail is the candidate followed by the next non-noise samples above
    /// it, `probe_length` in total, padded with new samples above the top of
    /// the trace. A rise caused by one sample that stands above both of its
    /// neighbours and is more prominent than the candidate marks that sample
    /// as noise, and the tail is checked again without it.
    async fn tail_declines(&mut self, candidate: usize) -> Result<bool, Halt> {
        let length = self.config.probe_length;
        loop {
            let mut tail = vec![candidate];
            while tail.len() < length {
                let next = match self.next_kept(tail[tail.len() - 1]) {
                    Some(next) => next,
                    None => self.extend_top().await?,
                };
                tail.push(next);
            }

            let scores = self.trace.scores();
            let rise = tail
                .windows(2)
                .find(|pair| scores[pair[1]] > scores[pair[0]])
                .map(|pair| pair[1]);
            let Some(rise) = rise else {
                debug!(z = self.trace.positions()[candidate], "tail declines");
                return Ok(true);
            };

            let above = match self.next_kept(rise) {
                Some(above) => above,
                None => self.extend_top().await?,
            };
            let scores = self.trace.scores();
            let isolated = scores[above] < scores[rise]
                && self.prominence(rise) > self.prominence(candidate);
            let z = self.trace.positions()[rise];
            if !isolated {
                debug!(z = self.trace.positions()[candidate], rise = z, "tail rises");
                return Ok(false);
            }
            debug!(z, "isolated sample marked as noise");
            self.noise[rise] = true;
        }
    }

    async fn extend_top(&mut self) -> Result<usize, Halt> {
        let z = self.top() + self.config.step_size_um;
        self.sample_above(z).await?;
        Ok(self.trace.len() - 1)
    }

    /// Sample `refinement_points` heights across `[z - step, z + step]` for each
    /// refinement step and keep the sharpest.
    async fn refine(&mut self, coarse: f64) -> Result<f64, Halt> {
        let points = self.config.refinement_points;
        let mut z = coarse;
        for step in self.config.refinement_steps() {
            let mut best: Option<(f64, f64)> = None;
            for j in 0..points {
                let candidate = z - step + 2.0 * step * j as f64 / (points - 1) as f64;
                let score = self.sample(candidate).await?;
                self.trace.push_back(candidate, score);
                self.emit_and_check()?;
                if best.map_or(true, |(_, top)| score > top) {
                    best = Some((candidate, score));
                }
            }
            if let Some((best_z, score)) = best {
                debug!(step, z = best_z, score, "refinement pass");
                z = best_z;
            }
        }
        Ok(z)
    }

    fn window_peak(&self, direction: Direction) -> WindowPeak {
        let n = self.trace.len();
        let start = match direction {
            Direction::Up => n.saturating_sub(3),
            Direction::Down => 0,
        };
        let window = &self.trace.scores()[start..(start + 3).min(n)];
        let mut best = 0;
        for (i, score) in window.iter().enumerate() {
            if *score > window[best] {
                best = i;
            }
        }
        match best {
            0 => WindowPeak::Left,
            1 => WindowPeak::Middle,
            _ => WindowPeak::Right,
        }
    }

    /// A candidate leads when no other non-noise sample scores higher.
    fn is_leading(&self, candidate: usize) -> bool {
        if self.noise[candidate] {
            return false;
        }
        let score = self.trace.scores()[candidate];
        self.trace
            .scores()
            .iter()
            .zip(&self.noise)
            .filter(|(_, noise)| !**noise)
            .all(|(other, _)| *other <= score)
    }

    fn best_candidate(&self) -> Option<usize> {
        let scores = self.trace.scores();
        let mut best: Option<usize> = None;
        for (i, score) in scores.iter().enumerate() {
            if self.noise[i] {
                continue;
            }
            if best.map_or(true, |b| *score > scores[b]) {
                best = Some(i);
            }
        }
        best
    }

    fn next_kept(&self, index: usize) -> Option<usize> {
        (index + 1..self.trace.len()).find(|&i| !self.noise[i])
    }

    fn previous_kept(&self, index: usize) -> Option<usize> {
        (0..index).rev().find(|&i| !self.noise[i])
    }

    /// Score above the mean of the nearest non-noise neighbours on either side.
    fn prominence(&self, index: usize) -> f64 {
        let scores = self.trace.scores();
        let neighbours: Vec<f64> = [self.previous_kept(index), self.next_kept(index)]
            .into_iter()
            .flatten()
            .map(|i| scores[i])
            .collect();
        if neighbours.is_empty() {
            return 0.0;
        }
        scores[index] - neighbours.iter().sum::<f64>() / neighbours.len() as f64
    }

    fn beats_sample_below(&self, candidate: usize) -> bool {
        let scores = self.trace.scores();
        self.previous_kept(candidate)
            .map_or(true, |below| scores[candidate] > scores[below])
    }

    async fn sample_above(&mut self, z: f64) -> Result<f64, Halt> {
        let score = self.sample(z).await?;
        self.trace.push_back(z, score);
        self.noise.push(false);
        self.emit_and_check()?;
        Ok(score)
    }

    async fn sample_below(&mut self, z: f64) -> Result<f64, Halt> {
        let score = self.sample(z).await?;
        self.trace.push_front(z, score);
        self.noise.insert(0, false);
        self.emit_and_check()?;
        Ok(score)
    }

    /// Move to `z` at the reference x and y, capture and score one frame.
    async fn sample(&self, z: f64) -> Result<f64, Halt> {
        let excursion = (z - self.reference.z).abs();
        if excursion > self.config.max_excursion_um {
            return Err(self.not_found(excursion));
        }
        self.rig
            .motion
            .move_absolute(self.reference.with_z(z))
            .await?;
        let frame = self.rig.imaging.capture().await?;
        let score = self.rig.localizer.sharpness(&frame);
        debug!(z, score, "focus sample");
        Ok(score)
    }

    fn emit_and_check(&self) -> Result<(), Halt> {
        self.events
            .emit(ProgressEvent::TraceUpdated(self.trace.clone()));
        self.cancel.checkpoint()
    }

    fn top(&self) -> f64 {
        self.trace.last_position().unwrap_or(self.reference.z)
    }

    fn bottom(&self) -> f64 {
        self.trace.first_position().unwrap_or(self.reference.z)
    }

    fn furthest_excursion(&self) -> f64 {
        self.trace
            .positions()
            .iter()
            .map(|z| (z - self.reference.z).abs())
            .fold(0.0, f64::max)
    }

    fn not_found(&self, excursion_um: f64) -> Halt {
        Halt::Failed(RigError::FocusNotFound {
            iterations: self.iterations,
            excursion_um,
        })
    }
}
