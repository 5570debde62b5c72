mod backend;
mod backends;
mod result;

use anyhow::{anyhow, Result};

use crate::config::DetectionSettings;

pub use backend::Classifier;
pub use backends::ScriptedClassifier;
#[cfg(feature = "backend-tract")]
pub use backends::TractClassifier;
pub use result::Detection;

/// Build the classifier named by `settings.backend` and warm it up.
///
/// Any failure here (unknown backend, missing model) is a startup failure.
pub fn build_classifier(settings: &DetectionSettings) -> Result<Box<dyn Classifier>> {
    let mut classifier: Box<dyn Classifier> = match settings.backend.as_str() {
        "stub" => {
            log::warn!("classifier backend 'stub' never reports detections");
            Box::new(ScriptedClassifier::new())
        }
        #[cfg(feature = "backend-tract")]
        "tract" => Box::new(TractClassifier::new(
            &settings.model_path,
            settings.model_input_size,
            settings.model_input_size,
        )?),
        #[cfg(not(feature = "backend-tract"))]
        "tract" => {
            return Err(anyhow!(
                "classifier backend 'tract' requires the backend-tract feature"
            ))
        }
        other => return Err(anyhow!("unknown classifier backend '{}'", other)),
    };
    classifier.warm_up()?;
    log::info!(
        "classifier {} ready (target class {}, threshold {:.2})",
        classifier.name(),
        settings.target_class,
        settings.confidence_threshold
    );
    Ok(classifier)
}
