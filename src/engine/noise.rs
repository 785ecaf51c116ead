use crate::config::ScannerConfig;

/// Recognises per-frame "nothing to decode here" errors
#[derive(Debug, Clone, Default)]
pub struct NoiseFilter {
    patterns: Vec<String>,
}

impl NoiseFilter {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(config.noise_patterns.clone())
    }

    pub fn is_noise(&self, message: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && message.contains(pattern.as_str()))
    }
}
