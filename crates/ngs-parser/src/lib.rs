//! Email normalization: static rules, learned-pattern cache, LLM
//! fallback, and quarantine for what none of them can handle safely.

pub mod pipeline;
pub mod rules;
pub mod signature;

#[cfg(test)]
mod tests;

pub use pipeline::{EmailParser, ParseOutcome, ParserSettings};
pub use rules::{compile_parsers, default_parsers, RuleParser, RuleParserConfig};
