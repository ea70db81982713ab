//! Run context
//!
//! Every stage of the evaluation receives the [Context]: it holds the log target the stage
//! logs to and an optional [Render]er for the diagnostic plots.

use crate::{
    band::Band,
    compare::{FluxComparison, SedComparison},
    exposure::Image,
    flux::{Degeneracy, FluxDiscrepancy},
    matcher::{ParentOverlay, UnmatchedTable},
};

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("Failed to create the plot file")]
    Io(#[from] std::io::Error),
    #[error("Plotting backend failure: {0}")]
    Backend(String),
}
pub type Result<T> = std::result::Result<T, RenderError>;

/// Display of the evaluation diagnostics
///
/// All methods default to doing nothing.
pub trait Render {
    /// Peak intensity over noise of the undetected truth sources
    fn unmatched(
        &mut self,
        _bands: &[Band],
        _unmatched: &UnmatchedTable,
        _avg_noise: Option<&[f64]>,
    ) -> Result<()> {
        Ok(())
    }
    /// A parent with unmatched peaks
    fn parent_overlay(&mut self, _overlay: &ParentOverlay) -> Result<()> {
        Ok(())
    }
    /// An isolated source whose flux is far from the simulated one
    fn flux_discrepancy(&mut self, _discrepancy: &FluxDiscrepancy, _cutout: &Image) -> Result<()> {
        Ok(())
    }
    /// Template flux and correlations of the peaks of a deblended parent
    fn degeneracy(&mut self, _degeneracy: &Degeneracy) -> Result<()> {
        Ok(())
    }
    fn sed_comparison(&mut self, _sed: &SedComparison) -> Result<()> {
        Ok(())
    }
    fn flux_comparison(&mut self, _band: Band, _flux: &FluxComparison) -> Result<()> {
        Ok(())
    }
}

pub const DEFAULT_TARGET: &str = "deblend_sim";

pub struct Context {
    target: String,
    renderer: Option<Box<dyn Render>>,
}
impl Default for Context {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            renderer: None,
        }
    }
}
impl Context {
    pub fn new() -> Self {
        Default::default()
    }
    pub fn target<S: Into<String>>(self, target: S) -> Self {
        Self {
            target: target.into(),
            ..self
        }
    }
    pub fn renderer<R: Render + 'static>(self, renderer: R) -> Self {
        Self {
            renderer: Some(Box::new(renderer)),
            ..self
        }
    }
    /// Log target of the evaluation
    pub fn log_target(&self) -> &str {
        &self.target
    }
    pub fn has_renderer(&self) -> bool {
        self.renderer.is_some()
    }
    /// Hands the renderer, if any, to `f`
    pub fn render<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Render) -> Result<()>,
    {
        match self.renderer.as_mut() {
            Some(renderer) => f(renderer.as_mut()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    struct Counter(Rc<RefCell<usize>>);
    impl Render for Counter {
        fn sed_comparison(&mut self, _sed: &SedComparison) -> Result<()> {
            *self.0.borrow_mut() += 1;
            Ok(())
        }
    }

    #[test]
    fn render_when_set() {
        let mut ctx = Context::new();
        assert_eq!(ctx.log_target(), DEFAULT_TARGET);
        assert!(ctx
            .render(|_| Err(RenderError::Backend("unreachable".into())))
            .is_ok());

        let count = Rc::new(RefCell::new(0));
        let mut ctx = Context::new()
            .target("test")
            .renderer(Counter(Rc::clone(&count)));
        ctx.render(|r| r.sed_comparison(&SedComparison::default()))
            .unwrap();
        ctx.render(|r| r.unmatched(&[], &UnmatchedTable::default(), None))
            .unwrap();
        assert_eq!(*count.borrow(), 1);
        assert_eq!(ctx.log_target(), "test");
    }
}
