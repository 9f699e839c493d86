//! Reranker mode selection
//!
//! Resolves the `--reranker-mode` CLI setting against the families the loaded model supports.

use anyhow::{anyhow, Result};
use search_ranking_backend::ModelFamily;

/// CLI mode for reranker selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankMode {
    Auto,
    CrossEncoder,
    BiEncoder,
    Disabled,
}

impl std::str::FromStr for RerankMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(Self::Auto),
            "cross_encoder" => Ok(Self::CrossEncoder),
            "bi_encoder" => Ok(Self::BiEncoder),
            "disabled" | "none" => Ok(Self::Disabled),
            _ => Err(anyhow!(
                "Invalid reranker mode: {}. Valid values: auto, cross_encoder, bi_encoder, disabled",
                s
            )),
        }
    }
}

/// Determine the rerank model family from the CLI mode, the model capabilities and the family
/// the pipeline configuration asks for
///
/// # Errors
/// Returns error if a family is forced that the model does not support
pub fn determine_family(
    mode: &RerankMode,
    supported: &[ModelFamily],
    configured: ModelFamily,
) -> Result<ModelFamily> {
    let forced = match mode {
        RerankMode::Disabled => return Ok(ModelFamily::None),
        RerankMode::CrossEncoder => ModelFamily::CrossEncoder,
        RerankMode::BiEncoder => ModelFamily::BiEncoder,
        RerankMode::Auto => {
            if configured == ModelFamily::None || supported.contains(&configured) {
                return Ok(configured);
            }
            return match supported.first() {
                Some(family) => {
                    tracing::warn!(
                        "Configured {configured} reranking is not supported by the model, using {family}"
                    );
                    Ok(*family)
                }
                None => {
                    tracing::warn!("No rerank model loaded, reranking is disabled");
                    Ok(ModelFamily::None)
                }
            };
        }
    };

    if supported.contains(&forced) {
        Ok(forced)
    } else {
        Err(anyhow!(
            "The rerank model does not support {} reranking. \
             Use --reranker-mode auto or load a model that does.",
            forced
        ))
    }
}
