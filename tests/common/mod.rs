#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use imagenn::{
    AppError, Classifier, Config, FaceDetector, FeatureExtractor, FeatureVector, LabelScore,
    Pipeline, Result,
};

/// Reads "vectors" from the image bytes: comma separated floats.
#[derive(Default)]
pub struct TextExtractor {
    pub calls: AtomicUsize,
    pub fail_first: AtomicUsize,
    pub delay: Option<Duration>,
    pub running: AtomicUsize,
    pub peak_running: AtomicUsize,
}

impl TextExtractor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }
}

impl FeatureExtractor for TextExtractor {
    fn extract(&self, image: &[u8]) -> Result<FeatureVector> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        if self.fail_first.load(Ordering::SeqCst) > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::Extraction("transient failure".to_string()));
        }
        let text = std::str::from_utf8(image)
            .map_err(|e| AppError::Extraction(e.to_string()))?;
        text.split(',')
            .map(|v| {
                v.trim()
                    .parse::<f32>()
                    .map_err(|e| AppError::Extraction(format!("{:?}: {}", v, e)))
            })
            .collect()
    }
}

/// Returns `top_k` fixed labels with halving scores.
#[derive(Default)]
pub struct FixedClassifier {
    pub calls: AtomicUsize,
}

impl Classifier for FixedClassifier {
    fn classify(&self, _image: &[u8], top_k: usize) -> Result<Vec<LabelScore>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..top_k)
            .map(|i| LabelScore::new(format!("label{}", i), 0.5f32.powi(i as i32 + 1)))
            .collect())
    }
}

/// Reports one face per image and checks the staged file exists.
pub struct OneFaceDetector;

impl FaceDetector for OneFaceDetector {
    fn detect(&self, image_path: &Path) -> Result<usize> {
        if !image_path.exists() {
            return Err(AppError::Detection(format!("{} missing", image_path.display())));
        }
        Ok(1)
    }
}

/// Always fails, like a crashing external detector.
pub struct BrokenDetector;

impl FaceDetector for BrokenDetector {
    fn detect(&self, image_path: &Path) -> Result<usize> {
        Err(AppError::Detection(format!("cannot read {}", image_path.display())))
    }
}

pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.data_dir = root.join("static");
    config.upload_dir = root.join("uploads");
    config.pipeline.dims = 3;
    config.pipeline.ef_construction = 32;
    config.pipeline.num_top_predictions = 2;
    config.pipeline.workers = 2;
    config.pipeline.timeout = Duration::from_secs(5);
    config
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub extractor: Arc<TextExtractor>,
    pub classifier: Arc<FixedClassifier>,
}

pub fn harness(config: &Config, extractor: TextExtractor) -> Harness {
    harness_with_detector(config, extractor, Arc::new(OneFaceDetector))
}

pub fn harness_with_detector(
    config: &Config,
    extractor: TextExtractor,
    detector: Arc<dyn FaceDetector>,
) -> Harness {
    let extractor = Arc::new(extractor);
    let classifier = Arc::new(FixedClassifier::default());
    let pipeline = Pipeline::new(config, extractor.clone(), classifier.clone(), detector).unwrap();
    Harness {
        pipeline,
        extractor,
        classifier,
    }
}
