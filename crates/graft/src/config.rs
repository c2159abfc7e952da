//! Engine configuration.

use graft_asm::host_cpu_name;

/// Default size of one code-cache block, in bytes.
pub const DEFAULT_CODE_BLOCK_SIZE: usize = 4096;

/// Construction-time engine settings. An empty CPU name or feature list is
/// filled in from the host at engine initialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    cpu: String,
    features: Vec<String>,
    code_block_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu: String::new(),
            features: Vec::new(),
            code_block_size: DEFAULT_CODE_BLOCK_SIZE,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a CPU backend by name. The empty string means "discover the
    /// host CPU".
    pub fn cpu(&mut self, name: &str) -> &mut Self {
        self.cpu = name.to_string();
        self
    }

    /// Feature attributes handed to the backend.
    pub fn features(&mut self, features: &[&str]) -> &mut Self {
        self.features = features.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Size of each code-cache block. Must hold the largest translated
    /// patch plus the epilogue reserve.
    pub fn code_block_size(&mut self, size: usize) -> &mut Self {
        assert!(size >= 256, "code blocks below 256 bytes are unusable");
        self.code_block_size = size;
        self
    }

    /// The CPU name after host discovery.
    pub(crate) fn resolved_cpu(&self) -> String {
        if self.cpu.is_empty() {
            host_cpu_name()
        } else {
            self.cpu.clone()
        }
    }

    pub(crate) fn cpu_name(&self) -> &str {
        &self.cpu
    }

    pub(crate) fn feature_list(&self) -> &[String] {
        &self.features
    }

    pub(crate) fn block_size(&self) -> usize {
        self.code_block_size
    }
}
