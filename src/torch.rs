//! Code for loading and running the (trained) PyTorch classifier

use crate::config::{ModelFormat, ModelSettings};
use crate::transform;
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use tch::nn::{self, ModuleT};
use tch::{no_grad, vision, Device, Kind, Tensor};
use tracing::{debug, info};

/// A loaded image classifier. One instance is shared by every HTTP worker,
/// so implementations must be safe to call from several threads at once
pub trait Classifier: Debug + Send + Sync {
    /// Run a forward pass in inference mode. `input` is `1x3x224x224`, the
    /// result is the `1 x num_classes` logits
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    fn num_classes(&self) -> i64;

    fn format(&self) -> ModelFormat;
}

/// MobileNetV2 backbone with its last linear layer swapped for a
/// `num_classes`-way head. Parameter names follow torchvision
/// (`features.*`, `classifier.1.*`)
pub struct MobileNetV2 {
    // tch modules are not Sync
    net: Mutex<Box<dyn ModuleT + Send>>,
    _vs: nn::VarStore,
    num_classes: i64,
}

impl MobileNetV2 {
    /// Build the network and load its parameters from a safetensors or `.ot`
    /// weights file
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        let mut vs = nn::VarStore::new(Device::Cpu);
        let net = vision::mobilenet::v2(&vs.root(), settings.num_classes);
        vs.load(&settings.path)
            .with_context(|| format!("cannot load weights from {:?}", settings.path))?;

        Ok(MobileNetV2 {
            net: Mutex::new(Box::new(net)),
            _vs: vs,
            num_classes: settings.num_classes,
        })
    }
}

impl Debug for MobileNetV2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MobileNetV2 {{ num_classes: {} }}", self.num_classes)
    }
}

impl Classifier for MobileNetV2 {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        // never mutated, a poisoned lock is still safe to reuse
        let net = self.net.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(no_grad(|| net.forward_t(input, false)))
    }

    fn num_classes(&self) -> i64 {
        self.num_classes
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::MobileNetV2
    }
}

/// A TorchScript module loaded as-is
#[derive(Debug)]
pub struct TorchScript {
    model: Mutex<tch::CModule>,
    num_classes: i64,
}

impl TorchScript {
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        let mut model = tch::CModule::load(&settings.path)
            .with_context(|| format!("cannot load TorchScript module {:?}", settings.path))?;
        model.set_eval();

        Ok(TorchScript {
            model: Mutex::new(model),
            num_classes: settings.num_classes,
        })
    }
}

impl Classifier for TorchScript {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(no_grad(|| model.forward_ts(&[input]))?)
    }

    fn num_classes(&self) -> i64 {
        self.num_classes
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::TorchScript
    }
}

/// Load the configured classifier. Called once at startup
pub fn load_classifier(settings: &ModelSettings) -> Result<Box<dyn Classifier>> {
    let model: Box<dyn Classifier> = match settings.format {
        ModelFormat::MobileNetV2 => Box::new(MobileNetV2::load(settings)?),
        ModelFormat::TorchScript => Box::new(TorchScript::load(settings)?),
    };
    info!("loaded {model:?} from {:?}", settings.path);
    Ok(model)
}

/// A class prediction outputted by the classifier
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: i64,
    /// Softmax probability of `class`
    pub probability: f64,
    pub label: Option<String>,
}

/// Softmax then arg-max over `1 x classes` logits
pub fn classify(logits: &Tensor, labels: &[String]) -> Result<Prediction> {
    let size = logits.size();
    if size.len() != 2 || size[0] != 1 {
        bail!("expected logits of shape [1, classes], got {size:?}");
    }

    let probabilities = logits.f_softmax(-1, Some(Kind::Float))?;
    let class = probabilities.f_argmax(-1, false)?.f_int64_value(&[0])?;
    let probability = probabilities.f_double_value(&[0, class])?;

    Ok(Prediction {
        class,
        probability,
        label: labels.get(class as usize).cloned(),
    })
}

/// Why a prediction could not be computed
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("invalid base64 image: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("cannot identify image: {0}")]
    Image(#[from] image::ImageError),

    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
}

/// The request handler's view of the model: base 64 image in, class out
#[derive(Debug)]
pub struct Predictor {
    model: Box<dyn Classifier>,
    labels: Vec<String>,
}

impl Predictor {
    pub fn new(model: Box<dyn Classifier>, labels: Vec<String>) -> Self {
        Predictor { model, labels }
    }

    pub fn model(&self) -> &dyn Classifier {
        self.model.as_ref()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Decode, preprocess and classify one base 64 encoded image
    pub fn predict(&self, image_b64: &str) -> Result<Prediction, PredictError> {
        // line-wrapped (MIME style) input is accepted, padding is still checked
        let compact: Vec<u8> = image_b64
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let bytes = general_purpose::STANDARD.decode(compact)?;
        let input = transform::input_tensor(&bytes)?;
        debug!("decoded {} image bytes into {:?}", bytes.len(), input.size());

        self.infer(&input).map_err(PredictError::Inference)
    }

    fn infer(&self, input: &Tensor) -> Result<Prediction> {
        // libtorch errors surface as panics in the infallible tch calls
        let logits = panic::catch_unwind(AssertUnwindSafe(|| self.model.forward(input)))
            .map_err(|payload| {
                anyhow!("forward pass panicked: {}", panic_message(&*payload))
            })??;
        let size = logits.size();
        if size.last() != Some(&self.model.num_classes()) {
            bail!(
                "model returned {size:?}, expected {} classes",
                self.model.num_classes()
            );
        }
        classify(&logits, &self.labels)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test::{red_b64, solid_png};
    use base64::{engine::general_purpose, Engine as _};
    use std::path::PathBuf;

    fn labels() -> Vec<String> {
        vec!["not_rotten".into(), "rotten".into()]
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spoiler-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_classify() {
        let logits = Tensor::from_slice(&[0.1f32, 2.0]).view([1, 2]);
        let prediction = classify(&logits, &labels()).unwrap();
        assert_eq!(prediction.class, 1);
        assert_eq!(prediction.label.as_deref(), Some("rotten"));
        assert!(prediction.probability > 0.5 && prediction.probability < 1.0);

        let logits = Tensor::from_slice(&[3.0f32, -1.0]).view([1, 2]);
        assert_eq!(classify(&logits, &[]).unwrap().class, 0);
    }

    #[test]
    fn test_classify_bad_shape() {
        let logits = Tensor::from_slice(&[0.1f32, 2.0]);
        assert!(classify(&logits, &labels()).is_err());
    }

    #[test]
    fn test_predict_red() {
        let predictor = Predictor::new(Box::new(stub::ChannelMeans), labels());
        let first = predictor.predict(&red_b64()).unwrap();
        assert_eq!(first.class, 0);
        for _ in 0..3 {
            assert_eq!(predictor.predict(&red_b64()).unwrap(), first);
        }

        let green = general_purpose::STANDARD.encode(solid_png(64, 48, [0, 255, 0]));
        assert_eq!(predictor.predict(&green).unwrap().class, 1);
    }

    #[test]
    fn test_predict_not_base64() {
        let predictor = Predictor::new(Box::new(stub::ChannelMeans), labels());
        let err = predictor.predict("not-base64!!").unwrap_err();
        assert!(matches!(err, PredictError::Decode(_)), "{err:?}");
    }

    #[test]
    fn test_predict_line_wrapped() {
        let predictor = Predictor::new(Box::new(stub::ChannelMeans), labels());
        let b64 = red_b64();
        let lines: Vec<&str> = b64
            .as_bytes()
            .chunks(76)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect();

        for sep in ["\n", "\r\n"] {
            let wrapped = format!("{}{sep}", lines.join(sep));
            assert_eq!(predictor.predict(&wrapped).unwrap().class, 0);
        }

        // stripping whitespace does not relax the padding check
        let err = predictor.predict(&b64[..b64.len() - 1]).unwrap_err();
        assert!(matches!(err, PredictError::Decode(_)), "{err:?}");
    }

    #[test]
    fn test_predict_after_forward_panic() {
        let predictor = Predictor::new(Box::<stub::PanicsOnce>::default(), labels());
        let err = predictor.predict(&red_b64()).unwrap_err();
        assert!(matches!(err, PredictError::Inference(_)), "{err:?}");
        assert!(err.to_string().contains("out of memory"));

        assert_eq!(predictor.predict(&red_b64()).unwrap().class, 0);
    }

    #[test]
    fn test_predict_not_an_image() {
        let predictor = Predictor::new(Box::new(stub::ChannelMeans), labels());
        let noise: Vec<u8> = (0..512u32).map(|i| (i * 7919 % 251) as u8).collect();
        let err = predictor
            .predict(&general_purpose::STANDARD.encode(noise))
            .unwrap_err();
        assert!(matches!(err, PredictError::Image(_)), "{err:?}");
    }

    #[test]
    fn test_predict_wrong_output_shape() {
        let predictor = Predictor::new(Box::new(stub::WrongShape), labels());
        let err = predictor.predict(&red_b64()).unwrap_err();
        assert!(matches!(err, PredictError::Inference(_)), "{err:?}");
    }

    #[test]
    fn test_mobilenet_round_trip() {
        // randomly initialised weights, saved and reloaded through the
        // startup path
        let path = temp_path("mobilenet.ot");
        {
            let vs = nn::VarStore::new(Device::Cpu);
            let _net = vision::mobilenet::v2(&vs.root(), 2);
            vs.save(&path).unwrap();
        }

        let settings = ModelSettings {
            path: path.clone(),
            ..ModelSettings::default()
        };
        let model = load_classifier(&settings).unwrap();
        assert_eq!(model.format(), ModelFormat::MobileNetV2);

        let predictor = Predictor::new(model, labels());
        let first = predictor.predict(&red_b64()).unwrap();
        assert!(first.class == 0 || first.class == 1);
        assert_eq!(predictor.predict(&red_b64()).unwrap().class, first.class);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_weights() {
        for format in [ModelFormat::MobileNetV2, ModelFormat::TorchScript] {
            let settings = ModelSettings {
                path: temp_path("missing.pt"),
                format,
                ..ModelSettings::default()
            };
            assert!(load_classifier(&settings).is_err());
        }
    }

    #[test]
    fn test_corrupt_torchscript() {
        let path = temp_path("corrupt.pt");
        std::fs::write(&path, b"definitely not a zip archive").unwrap();
        let settings = ModelSettings {
            path: path.clone(),
            format: ModelFormat::TorchScript,
            ..ModelSettings::default()
        };
        assert!(load_classifier(&settings).is_err());
        std::fs::remove_file(&path).ok();
    }
}
