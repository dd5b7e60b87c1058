//! Recursive divide-and-conquer over a user's interaction history.
//!
//! A chunk is rendered and measured; when it does not fit the budget it is
//! halved at `len / 2` and both halves are resolved left before right. The
//! dry-run counters branch on the very same [`Splitter::decide`] call as the
//! generating paths, so classification and generation always agree.

use crate::backend::TextGenerator;
use crate::error::Result;
use crate::types::{BackendInput, InteractionRecord, PromptBudget};

/// Stand-in carried profile used when counting carry recursions
pub const DRY_RUN_CARRY: &str = "dummy_profile";

/// Outcome of evaluating one chunk against the budget
#[derive(Debug)]
pub enum SplitDecision<'a> {
    /// The rendered prompt fits; generate from it
    Fits(BackendInput),
    /// Too large; `left` is `records[..mid]`, `right` is `records[mid..]`
    Split {
        left: &'a [InteractionRecord],
        right: &'a [InteractionRecord],
    },
    /// A single record that does not fit on its own
    Irreducible,
}

/// Budget-aware recursion driver bound to one generator
pub struct Splitter<'g, G: TextGenerator + ?Sized> {
    generator: &'g G,
    budget: PromptBudget,
}

impl<'g, G: TextGenerator + ?Sized> Splitter<'g, G> {
    pub fn new(generator: &'g G, budget: PromptBudget) -> Self {
        Self { generator, budget }
    }

    /// Budget from the generator's context length and the reserved output
    pub fn for_generator(generator: &'g G, reserved_output_tokens: usize) -> Self {
        let budget = PromptBudget::new(generator.max_context_length(), reserved_output_tokens);
        Self::new(generator, budget)
    }

    pub fn budget(&self) -> PromptBudget {
        self.budget
    }

    pub fn generator(&self) -> &'g G {
        self.generator
    }

    pub fn max_output_tokens(&self) -> Option<u32> {
        u32::try_from(self.budget.reserved_output_tokens).ok()
    }

    /// Prepare a rendered prompt and check whether it fits
    pub fn fits(&self, prompt: &str) -> (BackendInput, bool) {
        let input = self.generator.prepare_input(prompt);
        let tokens = self.generator.tokens_length(&input);
        let fits = self.budget.fits(tokens);
        tracing::debug!(
            tokens,
            reserved = self.budget.reserved_output_tokens,
            max_context = self.budget.max_context_length,
            fits,
            "fit check"
        );
        (input, fits)
    }

    /// Evaluate one chunk whose prompt has already been rendered
    pub fn decide<'a>(&self, records: &'a [InteractionRecord], prompt: &str) -> SplitDecision<'a> {
        let (input, fits) = self.fits(prompt);
        if fits {
            return SplitDecision::Fits(input);
        }
        if records.len() <= 1 {
            return SplitDecision::Irreducible;
        }
        let (left, right) = records.split_at(records.len() / 2);
        SplitDecision::Split { left, right }
    }

    /// One generator call with the reserved output limit
    pub fn generate(&self, input: &BackendInput) -> Result<String> {
        self.generator.describe(input, self.max_output_tokens())
    }

    /// Generate independent fragments for every fitting chunk, left to right.
    ///
    /// An irreducible record contributes no fragment.
    pub fn resolve<F>(&self, records: &[InteractionRecord], render: &F) -> Result<Vec<String>>
    where
        F: Fn(&[InteractionRecord]) -> String,
    {
        let mut fragments = Vec::new();
        self.resolve_into(records, render, &mut fragments)?;
        Ok(fragments)
    }

    fn resolve_into<F>(
        &self,
        records: &[InteractionRecord],
        render: &F,
        fragments: &mut Vec<String>,
    ) -> Result<()>
    where
        F: Fn(&[InteractionRecord]) -> String,
    {
        match self.decide(records, &render(records)) {
            SplitDecision::Fits(input) => {
                fragments.push(self.generate(&input)?);
                Ok(())
            }
            SplitDecision::Irreducible => {
                tracing::warn!("dropping a record whose prompt exceeds the context budget");
                Ok(())
            }
            SplitDecision::Split { left, right } => {
                self.resolve_into(left, render, fragments)?;
                self.resolve_into(right, render, fragments)
            }
        }
    }

    /// Dry run of [`Splitter::resolve`]: number of fitting leaves, no generation
    pub fn count_leaves<F>(&self, records: &[InteractionRecord], render: &F) -> usize
    where
        F: Fn(&[InteractionRecord]) -> String,
    {
        match self.decide(records, &render(records)) {
            SplitDecision::Fits(_) => 1,
            SplitDecision::Irreducible => 0,
            SplitDecision::Split { left, right } => {
                self.count_leaves(left, render) + self.count_leaves(right, render)
            }
        }
    }

    /// Resolve a chunk sequentially, threading the carried profile.
    ///
    /// The left half's output replaces the carry before the right half is
    /// rendered. An irreducible record returns the carry unchanged.
    pub fn resolve_with_carry<F>(
        &self,
        records: &[InteractionRecord],
        carried: String,
        render: &F,
    ) -> Result<String>
    where
        F: Fn(&[InteractionRecord], &str) -> String,
    {
        match self.decide(records, &render(records, &carried)) {
            SplitDecision::Fits(input) => self.generate(&input),
            SplitDecision::Irreducible => {
                tracing::warn!("dropping a record whose prompt exceeds the context budget");
                Ok(carried)
            }
            SplitDecision::Split { left, right } => {
                let carried = self.resolve_with_carry(left, carried, render)?;
                self.resolve_with_carry(right, carried, render)
            }
        }
    }

    /// Dry run of [`Splitter::resolve_with_carry`].
    ///
    /// Once any leaf has produced output, later chunks are rendered with
    /// [`DRY_RUN_CARRY`] in place of the real profile.
    pub fn count_with_carry<F>(&self, records: &[InteractionRecord], carried: &str, render: &F) -> usize
    where
        F: Fn(&[InteractionRecord], &str) -> String,
    {
        self.count_carry_inner(records, carried, render).0
    }

    /// Returns (leaves, carry after this chunk)
    fn count_carry_inner<'c, F>(
        &self,
        records: &[InteractionRecord],
        carried: &'c str,
        render: &F,
    ) -> (usize, &'c str)
    where
        F: Fn(&[InteractionRecord], &str) -> String,
    {
        match self.decide(records, &render(records, carried)) {
            SplitDecision::Fits(_) => (1, DRY_RUN_CARRY),
            SplitDecision::Irreducible => (0, carried),
            SplitDecision::Split { left, right } => {
                let (left_count, carried) = self.count_carry_inner(left, carried, render);
                let (right_count, carried) = self.count_carry_inner(right, carried, render);
                (left_count + right_count, carried)
            }
        }
    }
}
