//! `--config` file: one JSON document with a section per stage

use lakemap_pipeline::{PipelineConfig, StripSelectionConfig, TilingConfig};
use lakemap_unet::TrainConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LakemapConfig {
    pub pipeline: PipelineConfig,
    pub tiling: TilingConfig,
    pub strips: StripSelectionConfig,
    pub train: TrainConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_optional() {
        let cfg: LakemapConfig = serde_json::from_str(
            r#"{"pipeline": {"elev_min": 600}, "tiling": {"keep_empty": true}, "train": {"epochs": 20}}"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.elev_min, 600.0);
        assert_eq!(cfg.pipeline.ndwi_threshold, 0.25);
        assert!(cfg.tiling.keep_empty);
        assert_eq!(cfg.tiling.tile_size, 256);
        assert_eq!(cfg.strips.max_strips, 10);
        assert_eq!(cfg.train.epochs, 20);
    }
}
