//! Grading session configuration.
//!
//! The session layout is derived from the main grading directory. Tunables
//! are loaded from `grading.json` in that directory (fallback: defaults).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Largest score table that fits across a letter-size page.
pub const MAX_TABLE_POINTS: u32 = 25;

/// File and directory structure of a grading session.
#[derive(Debug, Clone)]
pub struct Layout {
    pub main_dir: PathBuf,
    /// Scanned batches, one PDF per batch.
    pub scans_dir: PathBuf,
    /// Committed single-page documents named by identity code.
    pub pages_dir: PathBuf,
    /// Per-problem aggregate documents.
    pub for_grading_dir: PathBuf,
    /// Graded exams reassembled per exam copy.
    pub graded_dir: PathBuf,
    pub gradebook: PathBuf,
    /// Bundle of the still-unresolved pages.
    pub carryover: PathBuf,
    pub ledger: PathBuf,
    pub config_file: PathBuf,
}

impl Layout {
    pub fn new(main_dir: impl Into<PathBuf>, gradebook: Option<&str>) -> Self {
        let main_dir = main_dir.into();
        let scans_dir = main_dir.join("scans");
        // Only the file name of a custom gradebook is used; it lives in main_dir
        let gradebook_name = gradebook
            .and_then(|g| Path::new(g).file_name())
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "gradebook.csv".into());

        Self {
            pages_dir: main_dir.join("pages"),
            for_grading_dir: main_dir.join("for_grading"),
            graded_dir: main_dir.join("graded"),
            gradebook: main_dir.join(gradebook_name),
            carryover: scans_dir.join("missing_data.pdf"),
            ledger: main_dir.join("grading_data.json"),
            config_file: main_dir.join("grading.json"),
            scans_dir,
            main_dir,
        }
    }

    /// Create the working directories if needed.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.scans_dir, &self.pages_dir, &self.for_grading_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// File name of the carryover bundle inside `scans/`.
    pub fn carryover_name(&self) -> String {
        self.carryover
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Tunables of a grading session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingConfig {
    /// Exam name every identity code of this session must carry.
    #[serde(default)]
    pub exam_name: Option<String>,
    /// Max score per problem page; page `n` uses entry `min(n-1, len-1)`.
    #[serde(default = "default_max_points")]
    pub max_points: Vec<u32>,
    /// Clockwise rotation applied to scanned pages before they are committed.
    #[serde(default)]
    pub rotate: Option<i32>,
    #[serde(default)]
    pub code_reader: CodeReaderConfig,
    #[serde(default)]
    pub bubble_grid: BubbleGridConfig,
}

fn default_max_points() -> Vec<u32> {
    vec![20]
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            exam_name: None,
            max_points: default_max_points(),
            rotate: None,
            code_reader: CodeReaderConfig::default(),
            bubble_grid: BubbleGridConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeReaderConfig {
    /// Gray level separating ink from paper before morphological retries.
    #[serde(default = "default_code_threshold")]
    pub threshold: u8,
    #[serde(default = "default_kernel_bound")]
    pub max_kernel_width: u32,
    #[serde(default = "default_kernel_bound")]
    pub max_kernel_height: u32,
}

fn default_code_threshold() -> u8 {
    200
}

fn default_kernel_bound() -> u32 {
    5
}

impl Default for CodeReaderConfig {
    fn default() -> Self {
        Self {
            threshold: default_code_threshold(),
            max_kernel_width: default_kernel_bound(),
            max_kernel_height: default_kernel_bound(),
        }
    }
}

/// Geometry of the student-id bubble grid after rectification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BubbleGridConfig {
    /// Digit positions.
    pub columns: u32,
    /// Digit values `0..rows`.
    pub rows: u32,
    pub canonical_width: u32,
    pub canonical_height: u32,
    /// Horizontal pixel span of the bubble area in the canonical image.
    pub x_range: [u32; 2],
    /// Vertical pixel span of the bubble area in the canonical image.
    pub y_range: [u32; 2],
    pub binarize_threshold: u8,
    /// Minimum gap in mean intensity between the darkest and the runner-up row.
    pub min_contrast: u8,
}

impl Default for BubbleGridConfig {
    fn default() -> Self {
        Self {
            columns: 8,
            rows: 10,
            canonical_width: 800,
            canonical_height: 900,
            x_range: [18, 780],
            y_range: [165, 860],
            binarize_threshold: 220,
            min_contrast: 20,
        }
    }
}

impl GradingConfig {
    /// Load `grading.json` if present, otherwise use defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {:?}", path))?;
            let config: GradingConfig = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config: {:?}", path))?;
            info!("Loaded grading config from {:?}", path);
            config
        } else {
            GradingConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        crate::ledger::write_atomic(path, &json)
            .with_context(|| format!("Failed to write config: {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_points.is_empty() {
            anyhow::bail!("max_points must list at least one score");
        }
        if let Some(p) = self.max_points.iter().find(|&&p| p > MAX_TABLE_POINTS) {
            anyhow::bail!(
                "max score {} does not fit a score table (limit {})",
                p,
                MAX_TABLE_POINTS
            );
        }
        if let Some(r) = self.rotate {
            if r % 90 != 0 {
                anyhow::bail!("rotation must be a multiple of 90, got {}", r);
            }
        }
        let grid = &self.bubble_grid;
        if grid.columns == 0 || grid.rows == 0 {
            anyhow::bail!("bubble grid needs at least one row and column");
        }
        if grid.x_range[0] >= grid.x_range[1]
            || grid.y_range[0] >= grid.y_range[1]
            || grid.x_range[1] > grid.canonical_width
            || grid.y_range[1] > grid.canonical_height
        {
            anyhow::bail!("bubble grid ranges must lie inside the canonical image");
        }
        Ok(())
    }

    /// Max score of a page; cover pages are never scored.
    pub fn max_points_for(&self, page: u32) -> u32 {
        if page == 0 {
            return 0;
        }
        let idx = (page as usize - 1).min(self.max_points.len().saturating_sub(1));
        self.max_points.get(idx).copied().unwrap_or(0)
    }
}
