use crate::{
    catalog::CatalogError, compare::CompareError, context::RenderError,
    detection::DetectionError, exposure::ExposureError, flux::FluxError, matcher::MatchError,
    table::TableError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error in the `catalog` module")]
    Catalog(#[from] CatalogError),
    #[error("Error in the `detection` module")]
    Detection(#[from] DetectionError),
    #[error("Error in the `exposure` module")]
    Exposure(#[from] ExposureError),
    #[error("Error in the `matcher` module")]
    Match(#[from] MatchError),
    #[error("Error in the `flux` module")]
    Flux(#[from] FluxError),
    #[error("Error in the `compare` module")]
    Compare(#[from] CompareError),
    #[error("Error in the `table` module")]
    Table(#[from] TableError),
    #[error("Failed to render a plot")]
    Render(#[from] RenderError),
}
pub type Result<T> = std::result::Result<T, Error>;
