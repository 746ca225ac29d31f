use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DomainError, Result};
use crate::grid::{mesh_shape_2d, tiled_edges};
use crate::thread_comm::CommOptions;
use crate::Float;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub n_particles: usize,
    /// Number of threads, one rank each.
    pub n_threads: usize,
    pub seed: u64,
    /// Particles read by each rank per chunk.
    pub chunk_size: usize,
    /// Image size in pixels along the first axis.
    pub pixel_height: usize,
    /// Image size in pixels along the second axis.
    pub pixel_width: usize,
    /// Sub-domains are aligned to tiles of this many pixels.
    #[serde(default = "default_tile_padding")]
    pub tile_padding: usize,
    /// Largest smoothing length of a particle, in pixels.
    pub smoothing: Float,
    #[serde(default)]
    pub periodic: bool,
    /// Explicit bin edges; replaces the tiled image mesh when set.
    pub edges: Option<Vec<Vec<Float>>>,
    pub timeout_ms: Option<u64>,
    pub max_transfer_items: Option<usize>,
}

fn default_tile_padding() -> usize {
    256
}

impl Config {
    /// Bin edges of the decomposition.
    pub fn grid_edges(&self) -> Result<Vec<Vec<Float>>> {
        if let Some(edges) = &self.edges {
            // Sub-domains are painted as whole pixel tiles.
            if let Some(edge) = edges.iter().flatten().find(|e| e.fract() != 0.) {
                return Err(DomainError::Configuration(format!(
                    "edge {edge} does not lie on a pixel boundary"
                )));
            }
            return Ok(edges.clone());
        }
        if self.tile_padding == 0 {
            return Err(DomainError::Configuration(
                "tile_padding must be positive".to_string(),
            ));
        }
        let (nx, ny) = mesh_shape_2d(self.n_threads);
        Ok(vec![
            tiled_edges(self.pixel_height, nx, self.tile_padding),
            tiled_edges(self.pixel_width, ny, self.tile_padding),
        ])
    }

    pub fn comm_options(&self) -> CommOptions {
        let defaults = CommOptions::default();
        CommOptions {
            timeout: self.timeout_ms.map(Duration::from_millis),
            max_transfer_items: self.max_transfer_items.unwrap_or(defaults.max_transfer_items),
        }
    }
}

pub fn read_config() -> Result<Config> {
    let path = Path::new("config/config.toml");
    read_config_from(path)
}

pub fn read_config_from(path: &Path) -> Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("GRIDND"))
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| DomainError::Configuration(e.to_string()))?;
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Config {
        Config {
            n_particles: 1000,
            n_threads: 6,
            seed: 1,
            chunk_size: 100,
            pixel_height: 1000,
            pixel_width: 1500,
            tile_padding: 256,
            smoothing: 4.,
            periodic: false,
            edges: None,
            timeout_ms: Some(500),
            max_transfer_items: None,
        }
    }

    #[test]
    fn test_tiled_grid_edges() {
        let edges = sample().grid_edges().unwrap();
        assert_eq!(vec![0., 512., 1024.], edges[0]);
        assert_eq!(vec![0., 512., 1024., 1536.], edges[1]);
    }

    #[test]
    fn test_explicit_edges_win() {
        let config = Config {
            edges: Some(vec![vec![0., 1.]]),
            ..sample()
        };
        assert_eq!(vec![vec![0., 1.]], config.grid_edges().unwrap());
    }

    #[test]
    fn test_fractional_edges_rejected() {
        let config = Config {
            edges: Some(vec![vec![0., 10.5, 20.]]),
            ..sample()
        };
        assert!(matches!(
            config.grid_edges(),
            Err(DomainError::Configuration(_))
        ));
    }

    #[test]
    fn test_comm_options() {
        let options = sample().comm_options();
        assert_eq!(Some(Duration::from_millis(500)), options.timeout);
        assert_eq!(i32::MAX as usize, options.max_transfer_items);
    }

    #[test]
    fn test_read_config_file() {
        let path = std::env::temp_dir().join("gridnd_test_config.toml");
        std::fs::write(
            &path,
            "n_particles = 10\nn_threads = 2\nseed = 3\nchunk_size = 4\n\
             pixel_height = 64\npixel_width = 64\nsmoothing = 1.5\n",
        )
        .unwrap();
        let config = read_config_from(&path).unwrap();
        assert_eq!(10, config.n_particles);
        assert_eq!(256, config.tile_padding);
        assert!(!config.periodic);
        assert!(config.edges.is_none());
    }
}
