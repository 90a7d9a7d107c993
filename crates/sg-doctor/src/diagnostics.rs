use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level for diagnostic findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    /// Informational - no action needed
    Info,
    /// Warning - stale state or degraded filtering
    Warning,
    /// Error - requires attention
    Error,
    /// Critical - VMs are not isolated
    Critical,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (symbol, name) = match self {
            DiagnosticLevel::Info => ("ℹ️", "INFO"),
            DiagnosticLevel::Warning => ("⚠️", "WARN"),
            DiagnosticLevel::Error => ("❌", "ERROR"),
            DiagnosticLevel::Critical => ("🔥", "CRITICAL"),
        };
        write!(f, "{} {}", symbol, name)
    }
}

/// A single diagnostic result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub level: DiagnosticLevel,
    pub title: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl DiagnosticResult {
    pub fn new(level: DiagnosticLevel, title: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            details: details.into(),
            suggestion: None,
            command: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn display(&self) {
        println!("\n{} {}", self.level, self.title);
        println!("  {}", self.details);

        if let Some(suggestion) = &self.suggestion {
            println!("  💡 Suggestion: {}", suggestion);
        }

        if let Some(command) = &self.command {
            println!("  🔧 Fix: {}", command);
        }
    }
}

/// Findings grouped by section, in the order the checks ran.
#[derive(Debug, Default, Serialize)]
pub struct DiagnosticReport {
    sections: Vec<Section>,
}

#[derive(Debug, Serialize)]
struct Section {
    name: String,
    results: Vec<DiagnosticResult>,
}

impl DiagnosticReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_section(&mut self, name: impl Into<String>, results: Vec<DiagnosticResult>) {
        self.sections.push(Section {
            name: name.into(),
            results,
        });
    }

    pub fn results(&self) -> impl Iterator<Item = &DiagnosticResult> {
        self.sections.iter().flat_map(|s| s.results.iter())
    }

    pub fn section(&self, name: &str) -> Option<&[DiagnosticResult]> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.results.as_slice())
    }

    pub fn has_errors(&self) -> bool {
        self.results().any(|r| r.level >= DiagnosticLevel::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.results().any(|r| r.level == DiagnosticLevel::Warning)
    }

    pub fn display(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║              sgwarden Host Diagnostics Report                ║");
        println!("╚══════════════════════════════════════════════════════════════╝");

        for section in &self.sections {
            if section.results.is_empty() {
                continue;
            }

            println!("\n━━━ {} ━━━", section.name);

            for result in &section.results {
                result.display();
            }
        }

        let total_errors =
            self.count_by_level(DiagnosticLevel::Error) + self.count_by_level(DiagnosticLevel::Critical);
        let total_warnings = self.count_by_level(DiagnosticLevel::Warning);

        println!("\n━━━ Summary ━━━");
        if total_errors > 0 {
            println!("  ❌ {} error(s) found", total_errors);
        }
        if total_warnings > 0 {
            println!("  ⚠️  {} warning(s) found", total_warnings);
        }
        if total_errors == 0 && total_warnings == 0 {
            println!("  ✅ All checks passed!");
        }
    }

    pub fn count_by_level(&self, level: DiagnosticLevel) -> usize {
        self.results().filter(|r| r.level == level).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_by_severity() {
        let mut report = DiagnosticReport::new();
        report.add_section(
            "Host",
            vec![
                DiagnosticResult::new(DiagnosticLevel::Info, "ok", "fine"),
                DiagnosticResult::new(DiagnosticLevel::Warning, "stale", "record")
                    .with_command("sgwarden vm delete --name i-2-10-VM"),
            ],
        );
        assert!(report.has_warnings());
        assert!(!report.has_errors());

        report.add_section(
            "Chains",
            vec![DiagnosticResult::new(DiagnosticLevel::Critical, "open", "no drop")],
        );
        assert!(report.has_errors());
        assert_eq!(report.count_by_level(DiagnosticLevel::Critical), 1);
        assert_eq!(report.section("Host").map(<[_]>::len), Some(2));
    }

    #[test]
    fn serializes_without_empty_hints() {
        let result = DiagnosticResult::new(DiagnosticLevel::Error, "t", "d");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["level"], "error");
        assert!(json.get("command").is_none());
    }
}
