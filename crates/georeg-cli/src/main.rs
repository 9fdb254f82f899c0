//! georeg CLI: register orbital photographs against a georeferenced
//! reference image.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use georeg::{
    meters_per_degree, CaptureGeometry, FileRasterIo, FocalLengthTable, GroundResolutionEstimator,
    LonLat, MatchStrategy, PinholeGeometry, RasterIo, ReferenceGeoModel, ReferenceInput, Registrar,
    RegistrationConfig, RegistrationRequest, RegistrationResult, UncertaintyModeler,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "georeg")]
#[command(about = "Georegister orbital photographs against reference imagery")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register one photograph against a reference image.
    Register(CliRegisterArgs),

    /// Write the uncertainty raster of a stored registration result.
    Uncertainty(CliUncertaintyArgs),

    /// Estimate ground resolution from capture metadata.
    EstimateResolution(CliResolutionArgs),
}

#[derive(Debug, Clone, Args)]
struct CliRegisterArgs {
    /// Path to the photograph to register.
    #[arg(long)]
    image: PathBuf,

    /// Path to the reference image. Its bounds are read from the
    /// `<reference>.geo.json` sidecar.
    #[arg(long)]
    reference: PathBuf,

    /// Reference ground resolution (m/px). Derived from the sidecar bounds
    /// when omitted.
    #[arg(long)]
    reference_mpp: Option<f64>,

    /// Approximate longitude of the photograph centre.
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,

    /// Approximate latitude of the photograph centre.
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,

    /// Ground resolution of the photograph (m/px), when known.
    #[arg(long)]
    mpp: Option<f64>,

    /// Acquisition date (YYYY-MM-DD).
    #[arg(long)]
    date: NaiveDate,

    /// Matching effort.
    #[arg(long, value_enum, default_value_t = StrategyArg::Thorough)]
    strategy: StrategyArg,

    /// Registration configuration (JSON). Missing fields keep defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to write the registration result (JSON).
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct CliUncertaintyArgs {
    /// Registration result written by `register`.
    #[arg(long)]
    result: PathBuf,

    /// Output raster: `.json` for a float grid, anything else for a 16-bit
    /// image in meters.
    #[arg(long)]
    out: PathBuf,

    /// Registration configuration (JSON), for the uncertainty parameters.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CliResolutionArgs {
    /// Lens focal length in millimetres.
    #[arg(long)]
    focal_length_mm: Option<f64>,

    /// Use the pinhole model instead of the focal-length table.
    #[arg(long)]
    pinhole: bool,

    #[arg(long, default_value_t = 0)]
    width_px: u32,

    #[arg(long, default_value_t = 0)]
    height_px: u32,

    #[arg(long)]
    sensor_width_mm: Option<f64>,

    #[arg(long)]
    sensor_height_mm: Option<f64>,

    /// Spacecraft altitude in nautical miles.
    #[arg(long)]
    altitude_nmi: Option<f64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Fast,
    Thorough,
}

impl StrategyArg {
    fn to_core(self) -> MatchStrategy {
        match self {
            Self::Fast => MatchStrategy::Fast,
            Self::Thorough => MatchStrategy::Thorough,
        }
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Register(args) => run_register(&args),
        Commands::Uncertainty(args) => run_uncertainty(&args),
        Commands::EstimateResolution(args) => run_estimate_resolution(&args),
    }
}

fn load_config(path: Option<&Path>) -> CliResult<RegistrationConfig> {
    match path {
        Some(path) => {
            tracing::info!("Loading config: {}", path.display());
            Ok(RegistrationConfig::from_json_file(path)?)
        }
        None => Ok(RegistrationConfig::default()),
    }
}

fn open_gray(path: &Path) -> CliResult<image::GrayImage> {
    let img = image::open(path).map_err(|e| -> CliError {
        format!("Failed to open image {}: {}", path.display(), e).into()
    })?;
    Ok(img.to_luma8())
}

// ── register ───────────────────────────────────────────────────────────

fn run_register(args: &CliRegisterArgs) -> CliResult<()> {
    let config = load_config(args.config.as_deref())?;

    tracing::info!("Loading image: {}", args.image.display());
    let target = open_gray(&args.image)?;
    tracing::info!("Image size: {}x{}", target.width(), target.height());

    let raster_io = FileRasterIo;
    let reference_img = open_gray(&args.reference)?;
    let bounds = raster_io.read_geo_bounds(&args.reference)?;
    let (rw, rh) = reference_img.dimensions();
    let geo = ReferenceGeoModel::from_bounds(&bounds, rw, rh)?;
    let reference_mpp = args.reference_mpp.unwrap_or_else(|| {
        let (m_lon, _) = meters_per_degree(bounds.center().lat);
        bounds.width_deg() * m_lon / rw as f64
    });
    tracing::info!(
        "Reference {}x{} at {:.1} m/px, {}",
        rw,
        rh,
        reference_mpp,
        bounds
    );

    let reference_id = args.reference.display().to_string();
    let reference = ReferenceInput {
        id: &reference_id,
        image: &reference_img,
        geo,
        meters_per_pixel: reference_mpp,
    };
    let request = RegistrationRequest {
        target: &target,
        center: LonLat::new(args.lon, args.lat),
        meters_per_pixel: args.mpp,
        acquisition_date: args.date,
        strategy: args.strategy.to_core(),
    };

    let registrar = Registrar::new(&config);
    let result = registrar.register_image(&request, Some(reference), None);

    match result.failure_reason() {
        Some(reason) => tracing::warn!("Registration failed: {}", reason),
        None => {
            tracing::info!(
                "Confidence {}: {}/{} inliers, mean_err={:.2}px, p95={:.2}px",
                result.confidence,
                result.statistics.inliers,
                result.statistics.candidate_matches,
                result.statistics.mean_residual_px,
                result.statistics.p95_residual_px,
            );
            if let Some(center) = result.center {
                tracing::info!("Centre: lon {:.5}, lat {:.5}", center.lon, center.lat);
            }
        }
    }

    let json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&args.out, &json)?;
    tracing::info!("Result written to {}", args.out.display());
    Ok(())
}

// ── uncertainty ────────────────────────────────────────────────────────

fn run_uncertainty(args: &CliUncertaintyArgs) -> CliResult<()> {
    let config = load_config(args.config.as_deref())?;
    let json = std::fs::read_to_string(&args.result)?;
    let result: RegistrationResult = serde_json::from_str(&json)?;
    if !result.is_registered() {
        return Err(format!(
            "{} is not a registered result: {}",
            args.result.display(),
            result.failure_reason().unwrap_or("no confidence")
        )
        .into());
    }

    let modeler = UncertaintyModeler::new(config.uncertainty);
    let model = result.uncertainty(&modeler)?;
    FileRasterIo.write_float_raster(&args.out, &model.raster)?;

    println!("floor:          {:.1} m", model.floor_m);
    println!("raster range:   {:.1} .. {:.1} m", model.raster.min(), model.raster.max());
    println!("raster RMS:     {:.1} m", model.raster.rms());
    println!("reverse fit:    {:?}", model.reverse_fit);
    println!("tie point RMS:  {:.3} px", model.rms_error_px);
    tracing::info!("Raster written to {}", args.out.display());
    Ok(())
}

// ── estimate-resolution ────────────────────────────────────────────────

fn run_estimate_resolution(args: &CliResolutionArgs) -> CliResult<()> {
    let capture = CaptureGeometry {
        focal_length_mm: args.focal_length_mm,
        width_px: args.width_px,
        height_px: args.height_px,
        sensor_width_mm: args.sensor_width_mm,
        sensor_height_mm: args.sensor_height_mm,
        altitude_nmi: args.altitude_nmi,
    };
    let estimate = if args.pinhole {
        PinholeGeometry.estimate(&capture)
    } else {
        FocalLengthTable::default().estimate(&capture)
    };
    match estimate {
        Some(mpp) => {
            println!("{mpp:.2} m/px");
            Ok(())
        }
        None => Err("not enough capture metadata for an estimate".into()),
    }
}
