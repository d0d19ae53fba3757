//! Model artifacts and their interchange encodings
//!
//! The generic encoding is lossless JSON and is what gets uploaded. The other
//! four are textual facsimiles of common framework layouts, produced for
//! download only. Every encoder is a pure function of the artifact.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use super::network::{Mlp, ModelParameters, NetworkShape};
use super::{EngineError, Result};

pub const NATIVE_FORMAT_TAG: &str = "oblivion-native-v1";
pub const ARCHITECTURE: &str = "SimpleMLP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub training_loss: f64,
    pub trained_at: DateTime<Utc>,
    pub trained_by: String,
    pub format: String,
}

impl ArtifactMetadata {
    pub fn new(training_loss: f64, trained_at: DateTime<Utc>, trained_by: &str) -> Self {
        Self {
            training_loss,
            trained_at,
            trained_by: trained_by.to_string(),
            format: NATIVE_FORMAT_TAG.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelArtifact {
    pub architecture: String,
    pub input_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<Vec<f64>>,
    pub metadata: ArtifactMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactFormat {
    Generic,
    StateDict,
    Graph,
    Object,
    LayeredConfig,
}

impl ArtifactFormat {
    pub const ALL: [ArtifactFormat; 5] = [
        ArtifactFormat::Generic,
        ArtifactFormat::StateDict,
        ArtifactFormat::Graph,
        ArtifactFormat::Object,
        ArtifactFormat::LayeredConfig,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Generic => "json",
            ArtifactFormat::StateDict => "pt",
            ArtifactFormat::Graph => "onnx",
            ArtifactFormat::Object => "pkl",
            ArtifactFormat::LayeredConfig => "h5",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactFormat::Generic => "application/json",
            _ => "application/octet-stream",
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArtifactFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "generic" => Ok(ArtifactFormat::Generic),
            "pt" | "state-dict" | "pytorch" => Ok(ArtifactFormat::StateDict),
            "onnx" | "graph" => Ok(ArtifactFormat::Graph),
            "pkl" | "object" | "pickle" => Ok(ArtifactFormat::Object),
            "h5" | "layered-config" | "keras" => Ok(ArtifactFormat::LayeredConfig),
            other => Err(EngineError::UnknownFormat(other.to_string())),
        }
    }
}

impl ModelArtifact {
    pub fn from_network(network: &Mlp, metadata: ArtifactMetadata) -> Self {
        let shape = network.shape();
        let params = network.parameters();
        Self {
            architecture: ARCHITECTURE.to_string(),
            input_size: shape.input,
            hidden_size: shape.hidden,
            output_size: shape.output,
            weights: params.weights,
            biases: params.biases,
            metadata,
        }
    }

    /// Freshly initialized, untrained artifact
    pub fn untrained<R: Rng + ?Sized>(
        shape: NetworkShape,
        trained_by: &str,
        at: DateTime<Utc>,
        rng: &mut R,
    ) -> Self {
        let network = Mlp::new(shape, rng);
        Self::from_network(&network, ArtifactMetadata::new(0.0, at, trained_by))
    }

    pub fn shape(&self) -> NetworkShape {
        NetworkShape {
            input: self.input_size,
            hidden: self.hidden_size,
            output: self.output_size,
        }
    }

    pub fn parameters(&self) -> ModelParameters {
        ModelParameters {
            weights: self.weights.clone(),
            biases: self.biases.clone(),
        }
    }

    pub fn to_network(&self) -> Result<Mlp> {
        Mlp::from_parameters(self.shape(), &self.parameters())
    }

    /// Strict decode of the generic encoding
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let artifact: ModelArtifact = serde_json::from_slice(bytes)?;
        artifact.to_network()?;
        Ok(artifact)
    }

    pub fn encode(&self, format: ArtifactFormat) -> Result<Vec<u8>> {
        let bytes = match format {
            ArtifactFormat::Generic => serde_json::to_vec_pretty(self)?,
            ArtifactFormat::StateDict => serde_json::to_vec(&self.state_dict_document())?,
            ArtifactFormat::Graph => serde_json::to_vec(&self.graph_document())?,
            ArtifactFormat::Object => serde_json::to_vec(&self.object_document())?,
            ArtifactFormat::LayeredConfig => serde_json::to_vec(&self.layered_document())?,
        };
        Ok(bytes)
    }

    fn layer_dict(&self) -> Value {
        let layer = |v: &Vec<Vec<f64>>, i: usize| v.get(i).cloned().unwrap_or_default();
        json!({
            "layer1": layer(&self.weights, 0),
            "layer2": layer(&self.weights, 1),
            "biases1": layer(&self.biases, 0),
            "biases2": layer(&self.biases, 1),
        })
    }

    fn created(&self) -> String {
        self.metadata.trained_at.to_rfc3339()
    }

    fn state_dict_document(&self) -> Value {
        json!({
            "_format": "pytorch_state_dict_simulation",
            "model_state_dict": self.layer_dict(),
            "metadata": {
                "architecture": self.architecture,
                "created": self.created(),
            },
        })
    }

    fn graph_document(&self) -> Value {
        json!({
            "format_version": "1.0",
            "graph": {
                "nodes": [
                    { "op_type": "MatMul", "name": "layer1", "inputs": ["input"], "outputs": ["hidden"] },
                    { "op_type": "Relu", "name": "relu1", "inputs": ["hidden"], "outputs": ["hidden_activated"] },
                    { "op_type": "MatMul", "name": "layer2", "inputs": ["hidden_activated"], "outputs": ["output"] },
                    { "op_type": "Sigmoid", "name": "sigmoid", "inputs": ["output"], "outputs": ["prediction"] },
                ],
                "initializers": self.layer_dict(),
            },
            "metadata": {
                "producer": "Oblivion Native Worker",
                "created": self.created(),
            },
        })
    }

    fn object_document(&self) -> Value {
        json!({
            "__class__": "NeuralNetwork",
            "__module__": "oblivion.models",
            "state": self.layer_dict(),
            "config": {
                "input_size": self.input_size,
                "hidden_size": self.hidden_size,
                "output_size": self.output_size,
            },
        })
    }

    fn layered_document(&self) -> Value {
        json!({
            "keras_version": "2.x_compatible",
            "model_config": {
                "class_name": "Sequential",
                "config": {
                    "layers": [
                        { "class_name": "Dense", "config": { "units": self.hidden_size, "activation": "relu" } },
                        { "class_name": "Dense", "config": { "units": self.output_size, "activation": "sigmoid" } },
                    ],
                },
            },
            "model_weights": self.layer_dict(),
            "training_config": {
                "loss": "mse",
                "optimizer": "sgd",
            },
        })
    }
}

fn as_vector(value: &Value) -> Option<Vec<f64>> {
    value.as_array()?.iter().map(Value::as_f64).collect()
}

fn as_layers(value: &Value) -> Option<Vec<Vec<f64>>> {
    value.as_array()?.iter().map(as_vector).collect()
}

/// Find layer parameters in any of the layouts this node or older workers
/// have produced: `weights`/`biases` arrays (possibly nested one level under
/// `weights`), or a `layer1`/`layer2` dict (possibly under a facsimile's
/// wrapper key). Missing biases come back empty.
pub fn extract_parameters(value: &Value) -> Option<ModelParameters> {
    if let Some(weights) = value.get("weights") {
        if let Some(layers) = as_layers(weights) {
            let biases = value.get("biases").and_then(as_layers).unwrap_or_default();
            return Some(ModelParameters {
                weights: layers,
                biases,
            });
        }
        if let Some(params) = extract_parameters(weights) {
            return Some(params);
        }
    }

    if let (Some(l1), Some(l2)) = (
        value.get("layer1").and_then(as_vector),
        value.get("layer2").and_then(as_vector),
    ) {
        let biases = match (
            value.get("biases1").and_then(as_vector),
            value.get("biases2").and_then(as_vector),
        ) {
            (Some(b1), Some(b2)) => vec![b1, b2],
            _ => Vec::new(),
        };
        return Some(ModelParameters {
            weights: vec![l1, l2],
            biases,
        });
    }

    for key in ["model_state_dict", "state", "model_weights"] {
        if let Some(params) = value.get(key).and_then(extract_parameters) {
            return Some(params);
        }
    }

    value
        .get("graph")
        .and_then(|g| g.get("initializers"))
        .and_then(extract_parameters)
}

/// Build a network from any artifact layout, filling missing biases with zeros
pub fn load_network(bytes: &[u8], shape: NetworkShape) -> Result<Mlp> {
    let value: Value = serde_json::from_slice(bytes)?;
    let mut params = extract_parameters(&value)
        .ok_or_else(|| EngineError::Shape("no layer parameters found".to_string()))?;
    if params.biases.is_empty() {
        params.biases = vec![vec![0.0; shape.hidden], vec![0.0; shape.output]];
    }
    Mlp::from_parameters(shape, &params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_artifact() -> ModelArtifact {
        let mut rng = StdRng::seed_from_u64(5);
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        ModelArtifact::untrained(NetworkShape::default(), "WORKER-TEST0001", at, &mut rng)
    }

    #[test]
    fn test_generic_decode_preserves_structure() {
        let artifact = sample_artifact();
        let bytes = artifact.encode(ArtifactFormat::Generic).unwrap();
        let decoded = ModelArtifact::decode(&bytes).unwrap();
        assert_eq!(decoded, artifact);
        assert_eq!(decoded.weights[0].len(), 320);
        assert_eq!(decoded.metadata.format, NATIVE_FORMAT_TAG);
    }

    #[test]
    fn test_encoders_are_deterministic() {
        let artifact = sample_artifact();
        for format in ArtifactFormat::ALL {
            assert_eq!(
                artifact.encode(format).unwrap(),
                artifact.encode(format).unwrap(),
                "{} encoding changed between calls",
                format
            );
        }
    }

    #[test]
    fn test_facsimile_layouts() {
        let artifact = sample_artifact();
        let pt: Value =
            serde_json::from_slice(&artifact.encode(ArtifactFormat::StateDict).unwrap()).unwrap();
        assert_eq!(pt["_format"], "pytorch_state_dict_simulation");
        assert_eq!(pt["metadata"]["created"], "2024-03-01T12:00:00+00:00");

        let onnx: Value =
            serde_json::from_slice(&artifact.encode(ArtifactFormat::Graph).unwrap()).unwrap();
        let ops: Vec<&str> = onnx["graph"]["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["op_type"].as_str().unwrap())
            .collect();
        assert_eq!(ops, vec!["MatMul", "Relu", "MatMul", "Sigmoid"]);

        let pkl: Value =
            serde_json::from_slice(&artifact.encode(ArtifactFormat::Object).unwrap()).unwrap();
        assert_eq!(pkl["__module__"], "oblivion.models");
        assert_eq!(pkl["config"]["hidden_size"], 32);

        let h5: Value =
            serde_json::from_slice(&artifact.encode(ArtifactFormat::LayeredConfig).unwrap())
                .unwrap();
        assert_eq!(h5["model_config"]["config"]["layers"][0]["config"]["units"], 32);
        assert_eq!(h5["training_config"]["loss"], "mse");
    }

    #[test]
    fn test_every_facsimile_reloads() {
        let artifact = sample_artifact();
        for format in ArtifactFormat::ALL {
            let bytes = artifact.encode(format).unwrap();
            let network = load_network(&bytes, artifact.shape()).unwrap();
            assert_eq!(network.parameters(), artifact.parameters(), "{}", format);
        }
    }

    #[test]
    fn test_load_legacy_nested_weights_without_biases() {
        let doc = json!({
            "architecture": "BrowserMLP",
            "weights": {
                "architecture": "SimpleMLP",
                "weights": [vec![0.1; 320], vec![0.2; 32]],
                "version": "1.0"
            }
        });
        let network = load_network(&serde_json::to_vec(&doc).unwrap(), NetworkShape::default())
            .unwrap();
        assert_eq!(network.parameters().biases[0], vec![0.0; 32]);
    }

    #[test]
    fn test_format_aliases() {
        assert_eq!("generic".parse::<ArtifactFormat>().unwrap(), ArtifactFormat::Generic);
        assert_eq!("PT".parse::<ArtifactFormat>().unwrap(), ArtifactFormat::StateDict);
        assert_eq!(
            "layered-config".parse::<ArtifactFormat>().unwrap(),
            ArtifactFormat::LayeredConfig
        );
        assert!("tflite".parse::<ArtifactFormat>().is_err());
    }
}
