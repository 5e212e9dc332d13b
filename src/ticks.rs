use anyhow::{bail, Result};

use crate::pipeline::{dep, AnalysisReport, CommitContext, Deps, PipelineItem};
use crate::tree::TICK_MERGE_MARK;

/// Metadata about the consumed timeline, surfaced for the output header.
#[derive(Clone, Copy, Debug)]
pub struct TimeSpan {
    pub begin_unix: i64,
    pub end_unix: i64,
    pub last_tick: u32,
}

/// Commit times earlier than this (epoch + 20 years) are almost certainly
/// clock garbage; we warn once and carry on.
const SUSPICIOUS_EPOCH: i64 = 20 * 365 * 24 * 3600;

/// Maps committer timestamps onto integer ticks. The first commit pins
/// `tick0` to its committer time floored to the tick size; later commits are
/// clamped so that ticks never decrease even across rebases.
pub struct TickMapper {
    tick_size_secs: i64,
    tick0: Option<i64>,
    last_tick: u32,
    begin_time: i64,
    end_time: i64,
}

impl TickMapper {
    pub fn new(tick_size_hours: u32) -> Self {
        Self {
            tick_size_secs: tick_size_hours as i64 * 3600,
            tick0: None,
            last_tick: 0,
            begin_time: 0,
            end_time: 0,
        }
    }

}

impl PipelineItem for TickMapper {
    fn name(&self) -> &'static str {
        "TickMapper"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[dep::TICK]
    }

    fn consume(&mut self, ctx: &CommitContext, deps: &mut Deps) -> Result<()> {
        let seconds = ctx.commit.time().seconds();
        let tick0 = match self.tick0 {
            Some(tick0) => tick0,
            None => {
                let tick0 = seconds - seconds.rem_euclid(self.tick_size_secs);
                if tick0 < SUSPICIOUS_EPOCH {
                    log::warn!(
                        "commit {} has committer time {}; timestamps this old are usually bogus",
                        ctx.commit.id(),
                        seconds
                    );
                }
                self.tick0 = Some(tick0);
                self.begin_time = seconds;
                tick0
            }
        };

        let raw = (seconds - tick0) / self.tick_size_secs;
        let tick = raw.max(self.last_tick as i64) as u32;
        if tick >= TICK_MERGE_MARK {
            bail!(
                "commit {} lands on tick {} which exceeds the supported range",
                ctx.commit.id(),
                tick
            );
        }
        self.last_tick = tick;
        self.end_time = self.end_time.max(seconds);
        deps.provide(dep::TICK, tick);
        Ok(())
    }

    fn fork(&mut self) -> Box<dyn PipelineItem> {
        Box::new(Self {
            tick_size_secs: self.tick_size_secs,
            tick0: self.tick0,
            last_tick: self.last_tick,
            begin_time: self.begin_time,
            end_time: self.end_time,
        })
    }

    fn merge(&mut self, others: Vec<Box<dyn PipelineItem>>) -> Result<()> {
        // Branches clamp independently; the merged timeline resumes from the
        // newest one. An orphan root (unrelated-history merge) may start
        // earlier than the primary branch, so the beginning moves too.
        for other in others {
            if let Ok(other) = other.into_any().downcast::<Self>() {
                self.last_tick = self.last_tick.max(other.last_tick);
                self.end_time = self.end_time.max(other.end_time);
                if other.tick0.is_some() {
                    self.begin_time = if self.tick0.is_some() {
                        self.begin_time.min(other.begin_time)
                    } else {
                        other.begin_time
                    };
                }
            }
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Option<AnalysisReport> {
        Some(AnalysisReport::Times(TimeSpan {
            begin_unix: self.begin_time,
            end_unix: self.end_time,
            last_tick: self.last_tick,
        }))
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_floor_and_clamp() {
        let mut mapper = TickMapper::new(24);
        // emulate consume() arithmetic without a repository
        let day = 24 * 3600i64;
        let t0: i64 = 1_600_000_000;
        let tick0 = t0 - t0.rem_euclid(day);
        assert_eq!((t0 - tick0) / day, 0);
        assert_eq!((t0 + 3 * day - tick0) / day, 3);
        // a rebase that travels back in time keeps the previous tick
        mapper.last_tick = 5;
        let raw = (t0 + day - tick0) / day;
        assert_eq!(raw.max(mapper.last_tick as i64), 5);
    }
}
