use regex::Regex;

/// Textual markers the installer helper prints. Swapping the table is all it
/// takes to drive a helper with a different vocabulary.
#[derive(Debug, Clone)]
pub struct MarkerTable {
    pub percent_progress: Regex,
    pub fraction_progress: Regex,
    pub confirm_prompt: String,
    /// Question shown to the user when `confirm_prompt` appears.
    pub confirm_text: String,
    pub two_factor_prompt: String,
    pub success: String,
    pub failure: String,
}

impl MarkerTable {
    pub fn altserver() -> Self {
        Self {
            percent_progress: Regex::new(r"Progress\s*:\s*([0-9.]+)\s*%").unwrap(),
            fraction_progress: Regex::new(r"(?:Signing\s+Progress|Progress)\s*:\s*([0-9eE+\-\.]+)")
                .unwrap(),
            confirm_prompt: "Are you sure you want to continue?".to_string(),
            confirm_text: "Continue installation?".to_string(),
            two_factor_prompt: "Enter two factor code".to_string(),
            success: "Notify: Installation Succeeded".to_string(),
            failure: "Could not".to_string(),
        }
    }
}

impl Default for MarkerTable {
    fn default() -> Self {
        Self::altserver()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMarker {
    Confirm,
    TwoFactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeMarker {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub fraction: f64,
    pub detail: String,
}

/// Everything a single output line says, in the order it must be acted on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineScan {
    pub progress: Option<ProgressUpdate>,
    pub prompts: Vec<PromptMarker>,
    pub outcome: Option<OutcomeMarker>,
}

#[derive(Debug, Clone, Default)]
pub struct LineParser {
    table: MarkerTable,
}

impl LineParser {
    pub fn new(table: MarkerTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &MarkerTable {
        &self.table
    }

    pub fn scan(&self, line: &str) -> LineScan {
        let mut prompts = Vec::new();
        if line.contains(&self.table.confirm_prompt) {
            prompts.push(PromptMarker::Confirm);
        }
        if line.contains(&self.table.two_factor_prompt) {
            prompts.push(PromptMarker::TwoFactor);
        }
        let outcome = if line.contains(&self.table.success) {
            Some(OutcomeMarker::Succeeded)
        } else if line.contains(&self.table.failure) {
            Some(OutcomeMarker::Failed)
        } else {
            None
        };
        LineScan {
            progress: self.progress(line),
            prompts,
            outcome,
        }
    }

    /// A percentage marker wins over the fractional form; fractions outside
    /// [0, 1] are ignored.
    pub fn progress(&self, line: &str) -> Option<ProgressUpdate> {
        if let Some(caps) = self.table.percent_progress.captures(line) {
            let value = caps[1].parse::<f64>().ok()?;
            return Some(ProgressUpdate {
                fraction: (value / 100.0).clamp(0.0, 1.0),
                detail: format!("{value:.0}%"),
            });
        }
        let caps = self.table.fraction_progress.captures(line)?;
        let value = caps[1].parse::<f64>().ok()?;
        if !(0.0..=1.0).contains(&value) {
            return None;
        }
        Some(ProgressUpdate {
            fraction: value,
            detail: format!("{}%", (value * 100.0) as i64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> LineParser {
        LineParser::default()
    }

    #[test]
    fn parses_percentage_progress() {
        let update = parser().progress("Installation Progress: 55%").expect("progress");
        assert!((update.fraction - 0.55).abs() < 1e-9);
        assert_eq!(update.detail, "55%");
        assert_eq!(parser().progress("Progress: 12.6 %").expect("progress").detail, "13%");
    }

    #[test]
    fn parses_fractional_progress_in_range_only() {
        let update = parser().progress("Signing Progress: 0.25").expect("progress");
        assert!((update.fraction - 0.25).abs() < 1e-9);
        assert_eq!(update.detail, "25%");
        assert!(parser().progress("Signing Progress: 1.5").is_none());
        assert!(parser().progress("Progress: -").is_none());
        assert!(parser().progress("Writing Info.plist").is_none());
    }

    #[test]
    fn detects_prompts_and_outcomes() {
        let p = parser();
        assert_eq!(
            p.scan("Are you sure you want to continue? (y/N)").prompts,
            vec![PromptMarker::Confirm]
        );
        assert_eq!(p.scan("Enter two factor code").prompts, vec![PromptMarker::TwoFactor]);
        assert_eq!(
            p.scan("Notify: Installation Succeeded").outcome,
            Some(OutcomeMarker::Succeeded)
        );
        assert_eq!(
            p.scan("Could not install the app").outcome,
            Some(OutcomeMarker::Failed)
        );
        assert_eq!(p.scan("Signing Progress: 0.5"), LineScan {
            progress: Some(ProgressUpdate {
                fraction: 0.5,
                detail: "50%".to_string()
            }),
            prompts: Vec::new(),
            outcome: None,
        });
    }

    #[test]
    fn vocabulary_is_replaceable() {
        let mut table = MarkerTable::altserver();
        table.success = "ALL DONE".to_string();
        table.failure = "FATAL".to_string();
        let p = LineParser::new(table);
        assert_eq!(p.scan("ALL DONE").outcome, Some(OutcomeMarker::Succeeded));
        assert_eq!(p.scan("Could not reach").outcome, None);
        assert_eq!(p.scan("FATAL: boom").outcome, Some(OutcomeMarker::Failed));
    }
}
