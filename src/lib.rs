//! Deblender validation against simulated catalogs
//!
//! The peaks found in the merged detection catalog of a simulated exposure set are matched
//! to the simulated (truth) sources, the flux of the peaks is measured with one or several
//! deblending methods and compared to the simulated flux and SED.
//!
//! ```ignore
//! let bands = band::parse_bands("g,r,i")?;
//! let mut ctx = Context::new();
//! let catalog = SimCatalog::load(&ctx, "truth.pkl", &bands)?;
//! let detections = DetectionCatalog::from_path("detections.pkl")?;
//! let peaks = peaks::build_peak_table(&ctx, &detections, &bands);
//! let result = matcher::match_to_ref(
//!     &mut ctx,
//!     &peaks,
//!     &catalog,
//!     &bands,
//!     &MatchConfig::default(),
//!     None,
//! )?;
//! ```

pub mod band;
pub mod catalog;
pub mod compare;
pub mod context;
#[cfg(feature = "polars")]
pub mod dataframe;
pub mod detection;
pub mod error;
pub mod exposure;
pub mod flux;
pub mod matcher;
pub mod peaks;
#[cfg(feature = "plot")]
pub mod plot;
pub mod rtree;
pub mod stats;
pub mod table;

pub use band::{Band, PerBand};
pub use catalog::{SimCatalog, TruthSource};
pub use compare::{compare_meas_to_sim, CompareConfig, Comparison};
pub use context::{Context, Render};
pub use detection::{DetectionCatalog, Footprint};
pub use error::{Error, Result};
pub use exposure::{get_noise, Exposure, Image};
pub use flux::IsolatedFluxConfig;
pub use matcher::{match_to_ref, MatchConfig, MatchResult, MatchTable, UnmatchedTable};
pub use peaks::{PeakRow, PeakTable};
