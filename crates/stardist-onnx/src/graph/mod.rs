//! ONNX graph loading and metadata helpers
//!
//! The inspector works on the decoded protobuf rather than on an ONNX Runtime
//! session, so strides, kernels and resize factors can be read without
//! executing anything.

pub mod proto;

use prost::Message;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::error::{Result, SegmentationError};
use proto::{AttributeProto, GraphProto, ModelProto, NodeProto, TensorProto, ValueInfoProto};

/// A decoded ONNX graph
#[derive(Debug, Clone)]
pub struct GraphModel {
    graph: GraphProto,
    initializers: HashMap<String, usize>,
}

impl GraphModel {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let model =
            ModelProto::decode(bytes).map_err(|e| SegmentationError::GraphParse(e.to_string()))?;
        let graph = model
            .graph
            .ok_or_else(|| SegmentationError::GraphParse("model has no graph".to_string()))?;
        Ok(Self::from_graph(graph))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let model = Self::from_bytes(&bytes)?;
        debug!(
            "Parsed ONNX graph {:?}: {} nodes, {} initializers",
            path,
            model.graph.node.len(),
            model.graph.initializer.len()
        );
        Ok(model)
    }

    pub fn from_graph(graph: GraphProto) -> Self {
        let initializers = graph
            .initializer
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Self {
            graph,
            initializers,
        }
    }

    pub fn graph(&self) -> &GraphProto {
        &self.graph
    }

    pub fn nodes(&self) -> &[NodeProto] {
        &self.graph.node
    }

    pub fn initializer(&self, name: &str) -> Option<&TensorProto> {
        self.initializers
            .get(name)
            .map(|&i| &self.graph.initializer[i])
    }

    /// Graph inputs that are fed at run time (initializers excluded)
    pub fn input_infos(&self) -> Vec<TensorInfo> {
        self.graph
            .input
            .iter()
            .filter(|v| !self.initializers.contains_key(&v.name))
            .map(TensorInfo::from_value_info)
            .collect()
    }

    pub fn output_infos(&self) -> Vec<TensorInfo> {
        self.graph
            .output
            .iter()
            .map(TensorInfo::from_value_info)
            .collect()
    }

    /// Names of the tensors produced at the graph outputs
    pub fn output_names(&self) -> HashSet<&str> {
        self.graph.output.iter().map(|v| v.name.as_str()).collect()
    }
}

/// One dimension of a declared tensor shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
    Unknown,
}

/// Name and declared shape of a graph input or output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<Dim>,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, dims: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }

    fn from_value_info(info: &ValueInfoProto) -> Self {
        let dims = info
            .r#type
            .as_ref()
            .and_then(|t| t.tensor_type.as_ref())
            .and_then(|t| t.shape.as_ref())
            .map(|s| {
                s.dim
                    .iter()
                    .map(|d| match (&d.dim_value, &d.dim_param) {
                        (Some(v), _) => Dim::Fixed(*v),
                        (None, Some(p)) if !p.is_empty() => Dim::Symbolic(p.clone()),
                        _ => Dim::Unknown,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self::new(info.name.clone(), dims)
    }

    /// Shape rendered for display, e.g. `["1", "H (dynamic)", "W (dynamic)", "1"]`
    pub fn describe(&self) -> Vec<String> {
        self.dims
            .iter()
            .map(|d| match d {
                Dim::Fixed(v) => v.to_string(),
                Dim::Symbolic(p) => format!("{p} (dynamic)"),
                Dim::Unknown => "?".to_string(),
            })
            .collect()
    }

    fn trailing(&self) -> Option<&Dim> {
        self.dims.last()
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.describe().join(", "))
    }
}

/// Resolved tensor names for the image input and the two network heads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoNames {
    pub input: String,
    pub prob: String,
    pub dist: String,
}

/// Pick the image input and the probability/distance outputs.
///
/// Outputs are matched by name first (`prob`, `dist`), then by trailing
/// channel count (1 for probability, anything else for distances), then by
/// position. The two heads always resolve to different outputs.
pub fn resolve_io_names(inputs: &[TensorInfo], outputs: &[TensorInfo]) -> Result<IoNames> {
    let input = inputs
        .first()
        .ok_or_else(|| SegmentationError::InvalidGraph("ONNX model has no inputs".to_string()))?;
    if outputs.len() < 2 {
        return Err(SegmentationError::InvalidGraph(
            "ONNX model must have prob and dist outputs".to_string(),
        ));
    }

    let mut prob: Option<&TensorInfo> = None;
    let mut dist: Option<&TensorInfo> = None;
    for output in outputs {
        let lower = output.name.to_lowercase();
        if lower.contains("prob") && prob.is_none() {
            prob = Some(output);
        } else if lower.contains("dist") && dist.is_none() {
            dist = Some(output);
        }
    }

    let taken = |slot: Option<&TensorInfo>, output: &TensorInfo| {
        slot.is_some_and(|t| t.name == output.name)
    };
    if prob.is_none() || dist.is_none() {
        for output in outputs {
            if taken(prob, output) || taken(dist, output) {
                continue;
            }
            let channel = output.trailing();
            let single = matches!(channel, Some(Dim::Fixed(1)));
            let multi = !single && matches!(channel, Some(Dim::Fixed(_) | Dim::Symbolic(_)));
            if single && prob.is_none() {
                prob = Some(output);
            } else if multi && dist.is_none() {
                dist = Some(output);
            }
        }
    }

    let (prob, dist) = match (prob, dist) {
        (Some(p), Some(d)) => (p, d),
        (Some(p), None) => (p, first_other(outputs, p)),
        (None, Some(d)) => (first_other(outputs, d), d),
        (None, None) => (&outputs[0], &outputs[1]),
    };
    if prob.name == dist.name {
        return Err(SegmentationError::InvalidGraph(format!(
            "prob and dist both resolve to output '{}'",
            prob.name
        )));
    }
    Ok(IoNames {
        input: input.name.clone(),
        prob: prob.name.clone(),
        dist: dist.name.clone(),
    })
}

/// First output other than `used`; `outputs` holds at least two entries
fn first_other<'a>(outputs: &'a [TensorInfo], used: &TensorInfo) -> &'a TensorInfo {
    outputs
        .iter()
        .find(|o| o.name != used.name)
        .unwrap_or(&outputs[1])
}

pub fn attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

/// Integer-list attribute, `None` when absent or empty
pub fn attr_ints(node: &NodeProto, name: &str) -> Option<Vec<i64>> {
    attr(node, name)
        .map(|a| a.ints.clone())
        .filter(|ints| !ints.is_empty())
}

pub fn attr_floats(node: &NodeProto, name: &str) -> Option<Vec<f32>> {
    attr(node, name)
        .map(|a| a.floats.clone())
        .filter(|floats| !floats.is_empty())
}

/// Builders for synthetic graphs used by unit tests
#[cfg(test)]
pub(crate) mod testing {
    use super::proto::*;
    use prost::Message;

    pub fn ints_attr(name: &str, ints: &[i64]) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            ints: ints.to_vec(),
            r#type: 7,
            ..Default::default()
        }
    }

    pub fn node(op: &str, inputs: &[&str], output: &str, attrs: Vec<AttributeProto>) -> NodeProto {
        NodeProto {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.to_string()],
            name: format!("{op}_{output}"),
            op_type: op.to_string(),
            attribute: attrs,
            ..Default::default()
        }
    }

    pub fn conv(input: &str, output: &str, kernel: i64, stride: i64) -> NodeProto {
        let weight = format!("{output}_w");
        node(
            "Conv",
            &[input, weight.as_str()],
            output,
            vec![
                ints_attr("kernel_shape", &[kernel, kernel]),
                ints_attr("strides", &[stride, stride]),
            ],
        )
    }

    pub fn max_pool(input: &str, output: &str, size: i64) -> NodeProto {
        node(
            "MaxPool",
            &[input],
            output,
            vec![
                ints_attr("kernel_shape", &[size, size]),
                ints_attr("strides", &[size, size]),
            ],
        )
    }

    pub fn float_tensor(name: &str, dims: &[i64], values: &[f32]) -> TensorProto {
        TensorProto {
            dims: dims.to_vec(),
            data_type: DATA_TYPE_FLOAT,
            float_data: values.to_vec(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// `Resize` with an NCHW-ordered scales initializer
    pub fn resize(input: &str, output: &str, factor: f32) -> (NodeProto, TensorProto) {
        let scales = format!("{output}_scales");
        let node = node("Resize", &[input, "", scales.as_str()], output, Vec::new());
        let tensor = float_tensor(&scales, &[4], &[1.0, 1.0, factor, factor]);
        (node, tensor)
    }

    pub fn value_info(name: &str, dims: &[Option<i64>]) -> ValueInfoProto {
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                tensor_type: Some(TensorTypeProto {
                    elem_type: DATA_TYPE_FLOAT,
                    shape: Some(TensorShapeProto {
                        dim: dims
                            .iter()
                            .map(|d| DimensionProto {
                                dim_value: *d,
                                dim_param: if d.is_none() {
                                    Some("H".to_string())
                                } else {
                                    None
                                },
                            })
                            .collect(),
                    }),
                }),
            }),
        }
    }

    /// Two pooling stages, then two upsampling stages back to full resolution
    pub fn unet_like() -> Vec<u8> {
        let (up1, s1) = resize("c3", "u1", 2.0);
        let (up2, s2) = resize("u1", "u2", 2.0);
        encode(
            vec![
                conv("image", "c1", 3, 1),
                max_pool("c1", "p1", 2),
                conv("p1", "c2", 3, 1),
                max_pool("c2", "p2", 2),
                conv("p2", "c3", 3, 1),
                up1,
                up2,
                conv("u2", "prob", 3, 1),
            ],
            vec![s1, s2],
            vec![value_info("image", &[Some(1), None, None, Some(1)])],
            vec![value_info("prob", &[Some(1), None, None, Some(1)])],
        )
    }

    pub fn encode(
        nodes: Vec<NodeProto>,
        initializers: Vec<TensorProto>,
        inputs: Vec<ValueInfoProto>,
        outputs: Vec<ValueInfoProto>,
    ) -> Vec<u8> {
        ModelProto {
            ir_version: 8,
            graph: Some(GraphProto {
                node: nodes,
                initializer: initializers,
                input: inputs,
                output: outputs,
                ..Default::default()
            }),
            ..Default::default()
        }
        .encode_to_vec()
    }
}
