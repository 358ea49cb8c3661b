//! Fuzzy phrase correction
//!
//! Recognized strings are scanned for word windows that closely resemble a
//! gazetteer entry; a close enough window is replaced by the entry itself.

pub mod gazetteer;

use serde::Serialize;
use strsim::normalized_levenshtein;
use tracing::debug;

use crate::config::CorrectionConfig;
use crate::storage::records::{CombinedRecord, LocalOcrOutcome, RecognitionOutcome};

/// Best gazetteer match found inside a string
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhraseMatch {
    /// Window of the input text that matched
    pub matched_phrase_in_text: String,
    /// Gazetteer entry it resembles
    pub matched_target: String,
    pub similarity_score: f64,
    /// Number of words in the window
    #[serde(skip)]
    pub window: usize,
    /// Index of the window's first word
    #[serde(skip)]
    pub position: usize,
}

/// What `correct_record` did to one combined record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCorrection {
    pub main_processed: bool,
    pub local_processed: bool,
    pub substitutions: usize,
}

/// N-gram fuzzy matcher against a fixed list of target phrases
#[derive(Debug, Clone)]
pub struct PhraseCorrector {
    targets: Vec<String>,
    max_n: usize,
    matching_threshold: f64,
    replacement_threshold: f64,
}

impl PhraseCorrector {
    /// Corrector over the configured gazetteer, or the built-in one when
    /// none is configured
    pub fn new(config: &CorrectionConfig) -> Self {
        let targets = if config.gazetteer.is_empty() {
            gazetteer::default_targets()
        } else {
            config.gazetteer.clone()
        };
        Self::with_targets(targets, config)
    }

    pub fn with_targets(targets: Vec<String>, config: &CorrectionConfig) -> Self {
        Self {
            targets,
            max_n: config.max_n,
            matching_threshold: config.matching_threshold,
            replacement_threshold: config.replacement_threshold,
        }
    }

    /// Best-scoring window across all window lengths and positions.
    ///
    /// Only strictly better scores replace the current best, so ties keep the
    /// shorter window, then the earlier position, then the earlier target.
    pub fn best_match(&self, text: &str) -> Option<PhraseMatch> {
        let words: Vec<&str> = text
            .trim()
            .split(|c: char| c.is_whitespace() || c == '-')
            .filter(|w| !w.is_empty())
            .collect();

        let mut best: Option<PhraseMatch> = None;
        for n in 1..=self.max_n {
            if n > words.len() {
                break;
            }
            for position in 0..=(words.len() - n) {
                let phrase = words[position..position + n].join(" ");
                for target in &self.targets {
                    let score = normalized_levenshtein(&phrase, target);
                    let improves = best.as_ref().map_or(true, |b| score > b.similarity_score);
                    if improves && score >= self.matching_threshold {
                        best = Some(PhraseMatch {
                            matched_phrase_in_text: phrase.clone(),
                            matched_target: target.clone(),
                            similarity_score: score,
                            window: n,
                            position,
                        });
                    }
                }
            }
        }
        best
    }

    /// Text with its best match substituted, if the match clears the
    /// replacement threshold. Only the first literal occurrence is replaced.
    pub fn correct(&self, text: &str) -> Option<String> {
        let found = self.best_match(text)?;
        if found.similarity_score < self.replacement_threshold {
            return None;
        }
        if !text.contains(&found.matched_phrase_in_text) {
            // Window was rebuilt with single spaces and no longer appears verbatim
            return None;
        }
        debug!(
            phrase = %found.matched_phrase_in_text,
            target = %found.matched_target,
            score = found.similarity_score,
            "Substituting gazetteer phrase"
        );
        Some(text.replacen(&found.matched_phrase_in_text, &found.matched_target, 1))
    }

    /// Apply `correct` in place, returning whether the text changed
    fn correct_in_place(&self, text: &mut String) -> bool {
        if text.is_empty() {
            return false;
        }
        match self.correct(text) {
            Some(corrected) if corrected != *text => {
                *text = corrected;
                true
            }
            _ => false,
        }
    }

    /// Correct every recognized span of both sources in one combined record
    pub fn correct_record(&self, record: &mut CombinedRecord) -> RecordCorrection {
        let mut report = RecordCorrection::default();

        if let Some(main) = record.main_recognition.as_mut() {
            report.main_processed = true;
            if let RecognitionOutcome::Recognized { recognized_texts, .. } = main {
                for item in recognized_texts.iter_mut().flatten() {
                    if self.correct_in_place(&mut item.text) {
                        report.substitutions += 1;
                    }
                }
            }
        }

        if let Some(local) = record.easy_ocr_recognition.as_mut() {
            report.local_processed = true;
            if let LocalOcrOutcome::Recognized { easy_ocr_results } = local {
                for item in easy_ocr_results.iter_mut() {
                    if self.correct_in_place(&mut item.text) {
                        report.substitutions += 1;
                    }
                }
            }
        }

        report
    }
}

impl Default for PhraseCorrector {
    fn default() -> Self {
        Self::new(&CorrectionConfig::default())
    }
}
