use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use tch::{CModule, Device, IValue, Kind, Tensor};

use crate::core::inference::{Classifier, FeatureExtractor};
use crate::error::AppError;
use crate::models::embedding::FeatureVector;
use crate::models::results::LabelScore;
use crate::state::ModelConfig;

/// A TorchScript image classifier that also exposes its penultimate layer.
///
/// The scripted module must return a `(logits, features)` tuple for a
/// `[1, 3, H, W]` input.
pub struct TchModel {
    module: Mutex<CModule>,
    labels: Vec<String>,
    device: Device,
    input_size: u32,
}

impl std::fmt::Debug for TchModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TchModel")
            .field("labels", &self.labels.len())
            .field("device", &self.device)
            .field("input_size", &self.input_size)
            .finish()
    }
}

impl TchModel {
    /// Load the module and label map described by `config`
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let device = Device::cuda_if_available();
        let model_path = config.model_path();
        let module = CModule::load_on_device(&model_path, device)
            .with_context(|| format!("loading model {}", model_path.display()))?;
        let labels = load_labels(&config.labels_path())?;
        log::info!(
            "Loaded model {} ({} labels) on {:?}",
            model_path.display(),
            labels.len(),
            device
        );

        Ok(Self {
            module: Mutex::new(module),
            labels,
            device,
            input_size: config.input_size,
        })
    }

    /// Human readable name of a class id, empty when the id is unknown
    pub fn label_for(&self, class_id: usize) -> &str {
        self.labels.get(class_id).map(String::as_str).unwrap_or("")
    }

    /// Run the network once, returning `(logits, features)` on the CPU
    fn forward(&self, image: &[u8]) -> Result<(Tensor, Tensor)> {
        let img = image::load_from_memory(image).context("decoding image")?;
        let input = self.preprocess_image(&img)?.to(self.device);

        let output = {
            let module = self
                .module
                .lock()
                .map_err(|_| anyhow!("model lock poisoned"))?;
            tch::no_grad(|| module.forward_is(&[IValue::Tensor(input)]))?
        };

        match output {
            IValue::Tuple(mut parts) if parts.len() == 2 => {
                let features = parts.pop();
                let logits = parts.pop();
                match (logits, features) {
                    (Some(IValue::Tensor(logits)), Some(IValue::Tensor(features))) => Ok((
                        logits.to_device(Device::Cpu),
                        features.to_device(Device::Cpu),
                    )),
                    _ => Err(anyhow!("model tuple does not hold two tensors")),
                }
            }
            other => Err(anyhow!("model returned {:?}, expected (logits, features)", other)),
        }
    }

    /// Preprocess an image for the model
    fn preprocess_image(&self, img: &DynamicImage) -> Result<Tensor> {
        let size = self.input_size;
        let img = img.resize_exact(size, size, image::imageops::FilterType::Triangle);
        let rgb_img = img.to_rgb8();

        // Planar CHW layout in [0, 1]
        let plane = (size * size) as usize;
        let mut data = vec![0f32; plane * 3];
        for (x, y, pixel) in rgb_img.enumerate_pixels() {
            let offset = (y * size + x) as usize;
            data[offset] = pixel[0] as f32 / 255.0;
            data[plane + offset] = pixel[1] as f32 / 255.0;
            data[2 * plane + offset] = pixel[2] as f32 / 255.0;
        }

        let side = size as i64;
        let tensor = Tensor::of_slice(&data)
            .reshape(&[3, side, side])
            .to_kind(Kind::Float);

        let mean = Tensor::of_slice(&[0.485f32, 0.456, 0.406]).view([3, 1, 1]);
        let std = Tensor::of_slice(&[0.229f32, 0.224, 0.225]).view([3, 1, 1]);
        let normalized = (tensor - &mean) / &std;

        // Add batch dimension [1, 3, H, W]
        Ok(normalized.unsqueeze(0))
    }
}

impl FeatureExtractor for TchModel {
    fn extract(&self, image: &[u8]) -> crate::Result<FeatureVector> {
        let (_, features) = self
            .forward(image)
            .map_err(|e| AppError::Extraction(format!("{:#}", e)))?;
        Vec::<f32>::try_from(features.reshape(&[-1]))
            .map_err(|e| AppError::Extraction(e.to_string()))
    }
}

impl Classifier for TchModel {
    fn classify(&self, image: &[u8], top_k: usize) -> crate::Result<Vec<LabelScore>> {
        let classification = |e: &dyn std::fmt::Display| AppError::Classification(e.to_string());

        let (logits, _) = self.forward(image).map_err(|e| classification(&format!("{:#}", e)))?;
        let probabilities = logits.reshape(&[-1]).softmax(-1, Kind::Float);
        let k = (top_k as i64).min(probabilities.size()[0]);
        let (scores, ids) = probabilities.topk(k, -1, true, true);

        let scores = Vec::<f32>::try_from(scores).map_err(|e| classification(&e))?;
        let ids = Vec::<i64>::try_from(ids).map_err(|e| classification(&e))?;

        Ok(ids
            .into_iter()
            .zip(scores)
            .map(|(id, score)| LabelScore::new(self.label_for(id as usize), score))
            .collect())
    }
}

/// Read a label map: one label per line, line number is the class id
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading labels {}", path.display()))?;
    Ok(text.lines().map(|line| line.trim().to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_labels() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "tench\ngoldfish \n\ngreat white shark\n").unwrap();

        let labels = load_labels(file.path()).unwrap();
        assert_eq!(labels, vec!["tench", "goldfish", "", "great white shark"]);
    }

    #[test]
    fn test_missing_model_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            model_dir: dir.path().to_path_buf(),
            ..ModelConfig::default()
        };
        assert!(TchModel::load(&config).is_err());
    }
}
