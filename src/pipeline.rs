//! The three interchangeable profile generation strategies.
//!
//! A [`Pipeline`] is selected once from a [`Strategy`] and a [`PromptSet`]
//! and exposes the same three operations for every variant:
//! `generate_one`, `generate_batch` and `count_splits`.

use serde::{Deserialize, Serialize};

use crate::backend::TextGenerator;
use crate::error::{ProfileError, Result};
use crate::prompts::{AggregateAfterPrompts, AspectPrompts, CarryPrompts, PromptSet};
use crate::splitter::Splitter;
use crate::types::{AspectProfile, InteractionRecord, ProfileOutput};

/// Profile aggregation strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Independent fragments over disjoint halves, merged at the end
    #[default]
    AggregateAfter,
    /// One profile carried left to right and rewritten per chunk
    AggregateWithCarry,
    /// Aggregate-after run once per aspect template
    MultiAspect,
}

impl std::str::FromStr for Strategy {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "agg_after" | "aggregate_after" => Ok(Strategy::AggregateAfter),
            "agg_with" | "aggregate_with_carry" => Ok(Strategy::AggregateWithCarry),
            "several_profiles" | "multi_aspect" => Ok(Strategy::MultiAspect),
            other => Err(ProfileError::Config(format!(
                "unsupported aggregation strategy '{}'",
                other
            ))),
        }
    }
}

/// Run one batch call and insist on one output per prompt
fn describe_all<G: TextGenerator + ?Sized>(
    splitter: &Splitter<'_, G>,
    prompts: &[String],
) -> Result<Vec<String>> {
    let generator = splitter.generator();
    let inputs: Vec<_> = prompts.iter().map(|p| generator.prepare_input(p)).collect();
    let outputs = generator.describe_batch(&inputs, splitter.max_output_tokens())?;
    if outputs.len() != inputs.len() {
        return Err(ProfileError::BatchSizeMismatch {
            expected: inputs.len(),
            actual: outputs.len(),
        });
    }
    Ok(outputs)
}

/// Collapse leaf fragments into one text.
///
/// A single fragment is returned as-is and no fragments yield an empty
/// profile; only two or more cost an extra merge call.
fn merge_fragments<G: TextGenerator + ?Sized>(
    splitter: &Splitter<'_, G>,
    mut fragments: Vec<String>,
    render_merge: impl Fn(&[String]) -> String,
) -> Result<String> {
    match fragments.len() {
        0 => Ok(String::new()),
        1 => Ok(fragments.remove(0)),
        n => {
            let (input, fits) = splitter.fits(&render_merge(&fragments));
            if !fits {
                tracing::warn!(fragments = n, "merge prompt exceeds the context budget");
            }
            tracing::debug!(fragments = n, "merging fragments");
            splitter.generate(&input)
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateAfter {
    prompts: AggregateAfterPrompts,
}

impl AggregateAfter {
    pub fn new(prompts: AggregateAfterPrompts) -> Self {
        Self { prompts }
    }

    pub fn generate_one<G: TextGenerator + ?Sized>(
        &self,
        records: &[InteractionRecord],
        splitter: &Splitter<'_, G>,
    ) -> Result<String> {
        let fragments = splitter.resolve(records, &|chunk| self.prompts.render_create(chunk))?;
        merge_fragments(splitter, fragments, |p| self.prompts.render_aggregate(p))
    }

    pub fn generate_batch<G: TextGenerator + ?Sized>(
        &self,
        users: &[&[InteractionRecord]],
        splitter: &Splitter<'_, G>,
    ) -> Result<Vec<String>> {
        let prompts: Vec<String> = users.iter().map(|r| self.prompts.render_create(r)).collect();
        describe_all(splitter, &prompts)
    }

    pub fn count_splits<G: TextGenerator + ?Sized>(
        &self,
        records: &[InteractionRecord],
        splitter: &Splitter<'_, G>,
    ) -> usize {
        splitter.count_leaves(records, &|chunk| self.prompts.render_create(chunk))
    }
}

#[derive(Debug, Clone)]
pub struct AggregateWithCarry {
    prompts: CarryPrompts,
}

impl AggregateWithCarry {
    pub fn new(prompts: CarryPrompts) -> Self {
        Self { prompts }
    }

    pub fn generate_one<G: TextGenerator + ?Sized>(
        &self,
        records: &[InteractionRecord],
        splitter: &Splitter<'_, G>,
    ) -> Result<String> {
        splitter.resolve_with_carry(records, String::new(), &|chunk, carried| {
            self.prompts.render(chunk, carried)
        })
    }

    pub fn generate_batch<G: TextGenerator + ?Sized>(
        &self,
        users: &[&[InteractionRecord]],
        splitter: &Splitter<'_, G>,
    ) -> Result<Vec<String>> {
        let prompts: Vec<String> = users.iter().map(|r| self.prompts.render(r, "")).collect();
        describe_all(splitter, &prompts)
    }

    pub fn count_splits<G: TextGenerator + ?Sized>(
        &self,
        records: &[InteractionRecord],
        splitter: &Splitter<'_, G>,
    ) -> usize {
        splitter.count_with_carry(records, "", &|chunk, carried| {
            self.prompts.render(chunk, carried)
        })
    }
}

#[derive(Debug, Clone)]
pub struct MultiAspect {
    prompts: AspectPrompts,
}

impl MultiAspect {
    pub fn new(prompts: AspectPrompts) -> Self {
        Self { prompts }
    }

    pub fn aspect_names(&self) -> Vec<&str> {
        self.prompts.aspects.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn generate_one<G: TextGenerator + ?Sized>(
        &self,
        records: &[InteractionRecord],
        splitter: &Splitter<'_, G>,
    ) -> Result<Vec<AspectProfile>> {
        self.prompts
            .aspects
            .iter()
            .map(|aspect| {
                let fragments = splitter
                    .resolve(records, &|chunk| self.prompts.render_aspect(aspect, chunk))?;
                let text =
                    merge_fragments(splitter, fragments, |p| self.prompts.render_aggregate(p))?;
                Ok(AspectProfile { aspect: aspect.name.clone(), text })
            })
            .collect()
    }

    /// One batch call per aspect, transposed back to per-user outputs
    pub fn generate_batch<G: TextGenerator + ?Sized>(
        &self,
        users: &[&[InteractionRecord]],
        splitter: &Splitter<'_, G>,
    ) -> Result<Vec<Vec<AspectProfile>>> {
        let mut per_user: Vec<Vec<AspectProfile>> = vec![Vec::new(); users.len()];
        for aspect in &self.prompts.aspects {
            let prompts: Vec<String> = users
                .iter()
                .map(|r| self.prompts.render_aspect(aspect, r))
                .collect();
            let outputs = describe_all(splitter, &prompts)?;
            for (profiles, text) in per_user.iter_mut().zip(outputs) {
                profiles.push(AspectProfile { aspect: aspect.name.clone(), text });
            }
        }
        Ok(per_user)
    }

    /// Leaves summed over aspects; a total within one leaf per aspect counts as 1.
    pub fn count_splits<G: TextGenerator + ?Sized>(
        &self,
        records: &[InteractionRecord],
        splitter: &Splitter<'_, G>,
    ) -> usize {
        let total: usize = self
            .prompts
            .aspects
            .iter()
            .map(|aspect| {
                splitter.count_leaves(records, &|chunk| self.prompts.render_aspect(aspect, chunk))
            })
            .sum();
        if total <= self.prompts.aspects.len() {
            1
        } else {
            total
        }
    }
}

/// A strategy bound to its templates
#[derive(Debug, Clone)]
pub enum Pipeline {
    AggregateAfter(AggregateAfter),
    AggregateWithCarry(AggregateWithCarry),
    MultiAspect(MultiAspect),
}

impl Pipeline {
    pub fn new(strategy: Strategy, prompts: &PromptSet) -> Self {
        match strategy {
            Strategy::AggregateAfter => {
                Pipeline::AggregateAfter(AggregateAfter::new(prompts.aggregate_after.clone()))
            }
            Strategy::AggregateWithCarry => {
                Pipeline::AggregateWithCarry(AggregateWithCarry::new(prompts.carry.clone()))
            }
            Strategy::MultiAspect => {
                Pipeline::MultiAspect(MultiAspect::new(prompts.multi_aspect.clone()))
            }
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Pipeline::AggregateAfter(_) => Strategy::AggregateAfter,
            Pipeline::AggregateWithCarry(_) => Strategy::AggregateWithCarry,
            Pipeline::MultiAspect(_) => Strategy::MultiAspect,
        }
    }

    /// Aspect names in output order; empty for single-text strategies
    pub fn aspect_names(&self) -> Vec<&str> {
        match self {
            Pipeline::MultiAspect(p) => p.aspect_names(),
            _ => Vec::new(),
        }
    }

    /// Full recursive generation for one user
    pub fn generate_one<G: TextGenerator + ?Sized>(
        &self,
        records: &[InteractionRecord],
        splitter: &Splitter<'_, G>,
    ) -> Result<ProfileOutput> {
        match self {
            Pipeline::AggregateAfter(p) => p.generate_one(records, splitter).map(ProfileOutput::Single),
            Pipeline::AggregateWithCarry(p) => {
                p.generate_one(records, splitter).map(ProfileOutput::Single)
            }
            Pipeline::MultiAspect(p) => p.generate_one(records, splitter).map(ProfileOutput::Aspects),
        }
    }

    /// One backend round-trip per prompt kind for users whose history fits.
    ///
    /// Outputs correspond positionally to `users`. Routing users that need
    /// splitting away from this path is the classifier's job.
    pub fn generate_batch<G: TextGenerator + ?Sized>(
        &self,
        users: &[&[InteractionRecord]],
        splitter: &Splitter<'_, G>,
    ) -> Result<Vec<ProfileOutput>> {
        if users.is_empty() {
            return Ok(Vec::new());
        }
        Ok(match self {
            Pipeline::AggregateAfter(p) => p
                .generate_batch(users, splitter)?
                .into_iter()
                .map(ProfileOutput::Single)
                .collect(),
            Pipeline::AggregateWithCarry(p) => p
                .generate_batch(users, splitter)?
                .into_iter()
                .map(ProfileOutput::Single)
                .collect(),
            Pipeline::MultiAspect(p) => p
                .generate_batch(users, splitter)?
                .into_iter()
                .map(ProfileOutput::Aspects)
                .collect(),
        })
    }

    /// Number of terminal generation calls `generate_one` would make
    pub fn count_splits<G: TextGenerator + ?Sized>(
        &self,
        records: &[InteractionRecord],
        splitter: &Splitter<'_, G>,
    ) -> usize {
        match self {
            Pipeline::AggregateAfter(p) => p.count_splits(records, splitter),
            Pipeline::AggregateWithCarry(p) => p.count_splits(records, splitter),
            Pipeline::MultiAspect(p) => p.count_splits(records, splitter),
        }
    }
}
