//! Raster file access at the library boundary.
//!
//! Geographic bounds of a georeferenced image live in a JSON sidecar next to
//! it (`<file>.geo.json`). Float rasters are written either as JSON or as a
//! 16-bit grey image with values rounded and clamped to `u16`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use image::{ImageBuffer, Luma};

use crate::error::Error;
use crate::geo::GeoBounds;
use crate::uncertainty::FloatRaster;

pub trait RasterIo: Send + Sync {
    fn read_image_size(&self, path: &Path) -> Result<(u32, u32), Error>;
    fn read_geo_bounds(&self, path: &Path) -> Result<GeoBounds, Error>;
    fn write_float_raster(&self, path: &Path, raster: &FloatRaster) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileRasterIo;

/// Sidecar path holding the geographic bounds of `image`.
pub fn geo_sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".geo.json");
    PathBuf::from(name)
}

/// Write `bounds` as the sidecar of `image`.
pub fn write_geo_bounds(image: &Path, bounds: &GeoBounds) -> Result<(), Error> {
    let file = File::create(geo_sidecar_path(image))?;
    serde_json::to_writer_pretty(BufWriter::new(file), bounds)?;
    Ok(())
}

impl RasterIo for FileRasterIo {
    fn read_image_size(&self, path: &Path) -> Result<(u32, u32), Error> {
        Ok(image::image_dimensions(path)?)
    }

    fn read_geo_bounds(&self, path: &Path) -> Result<GeoBounds, Error> {
        let file = File::open(geo_sidecar_path(path))?;
        let bounds: GeoBounds = serde_json::from_reader(BufReader::new(file))?;
        if !bounds.is_valid() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid geographic bounds for {}: {}", path.display(), bounds),
            )
            .into());
        }
        Ok(bounds)
    }

    fn write_float_raster(&self, path: &Path, raster: &FloatRaster) -> Result<(), Error> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            let file = File::create(path)?;
            serde_json::to_writer(BufWriter::new(file), raster)?;
        } else {
            let data: Vec<u16> = raster
                .data
                .iter()
                .map(|&v| v.round().clamp(0.0, u16::MAX as f32) as u16)
                .collect();
            let img = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(raster.width, raster.height, data)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "raster data does not match its size")
                })?;
            img.save(path)?;
        }
        tracing::debug!(path = %path.display(), raster.width, raster.height, "wrote float raster");
        Ok(())
    }
}
