//! Receptive-field estimate and the tile overlap derived from it

use std::collections::HashMap;
use tracing::debug;

use super::{constant_values, node_inputs, resample_factors, spatial_attr};
use crate::error::{Result, SegmentationError};
use crate::graph::proto::NodeProto;
use crate::graph::GraphModel;

#[derive(Debug, Clone)]
struct Field {
    /// Receptive-field size in input pixels
    size: Vec<f64>,
    /// Input-pixel distance between adjacent positions of this tensor
    jump: Vec<f64>,
}

impl Field {
    fn merge(fields: Vec<&Field>) -> Option<Field> {
        let mut iter = fields.into_iter();
        let first = iter.next()?.clone();
        Some(iter.fold(first, |acc, f| Field {
            size: acc.size.iter().zip(&f.size).map(|(a, b)| a.max(*b)).collect(),
            jump: acc.jump.iter().zip(&f.jump).map(|(a, b)| a.min(*b)).collect(),
        }))
    }
}

/// Per-axis minimum safe tile overlap: half the receptive field at the
/// graph outputs, rounded.
pub fn infer_overlap(graph: &GraphModel, ndim: usize) -> Result<Vec<usize>> {
    let rf = infer_receptive_field(graph, ndim)?;
    let overlap = rf.iter().map(|&r| (r / 2.0).round() as usize).collect();
    debug!("Receptive field {:?} -> overlap {:?}", rf, overlap);
    Ok(overlap)
}

/// Receptive-field size of the deepest tensor feeding the graph outputs
pub fn infer_receptive_field(graph: &GraphModel, ndim: usize) -> Result<Vec<f64>> {
    let constants = constant_values(graph);
    let mut fields: HashMap<String, Field> = graph
        .input_infos()
        .into_iter()
        .map(|input| {
            (
                input.name,
                Field {
                    size: vec![1.0; ndim],
                    jump: vec![1.0; ndim],
                },
            )
        })
        .collect();

    for node in graph.nodes() {
        let Some(incoming) = Field::merge(node_inputs(node, &fields)) else {
            continue;
        };
        let outgoing = match node.op_type.as_str() {
            "Conv" | "MaxPool" | "AveragePool" | "LpPool" => {
                let kernel = kernel_extent(graph, node, ndim);
                let strides = spatial_attr(node, "strides", ndim, 1);
                Field {
                    size: (0..ndim)
                        .map(|a| incoming.size[a] + (kernel[a] - 1.0) * incoming.jump[a])
                        .collect(),
                    jump: (0..ndim)
                        .map(|a| incoming.jump[a] * strides[a] as f64)
                        .collect(),
                }
            }
            "ConvTranspose" => {
                let kernel = kernel_extent(graph, node, ndim);
                let strides = spatial_attr(node, "strides", ndim, 1);
                let jump: Vec<f64> = (0..ndim)
                    .map(|a| incoming.jump[a] / strides[a].max(1) as f64)
                    .collect();
                Field {
                    size: (0..ndim)
                        .map(|a| incoming.size[a] + (kernel[a] - 1.0) * jump[a])
                        .collect(),
                    jump,
                }
            }
            "Resize" | "Upsample" => match resample_factors(node, &constants, ndim) {
                Some(f) => Field {
                    jump: (0..ndim)
                        .map(|a| if f[a] > 0.0 { incoming.jump[a] / f[a] } else { incoming.jump[a] })
                        .collect(),
                    size: incoming.size,
                },
                None => incoming,
            },
            _ => incoming,
        };
        for name in &node.output {
            fields.insert(name.clone(), outgoing.clone());
        }
    }

    let outputs = graph.output_names();
    let at_outputs: Vec<&Field> = fields
        .iter()
        .filter(|(name, _)| outputs.contains(name.as_str()))
        .map(|(_, f)| f)
        .collect();
    if at_outputs.is_empty() {
        return Err(SegmentationError::InvalidGraph(
            "no graph output is reachable from the input".to_string(),
        ));
    }
    Ok((0..ndim)
        .map(|a| at_outputs.iter().map(|f| f.size[a]).fold(1.0, f64::max))
        .collect())
}

/// Effective (dilated) kernel extent per spatial axis
fn kernel_extent(graph: &GraphModel, node: &NodeProto, ndim: usize) -> Vec<f64> {
    let kernel: Vec<i64> = match crate::graph::attr_ints(node, "kernel_shape") {
        Some(k) if k.len() == ndim => k,
        _ => node
            .input
            .get(1)
            .and_then(|w| graph.initializer(w))
            .filter(|w| w.dims.len() == ndim + 2)
            .map(|w| w.dims[2..].to_vec())
            .unwrap_or_else(|| vec![1; ndim]),
    };
    let dilations = spatial_attr(node, "dilations", ndim, 1);
    kernel
        .iter()
        .zip(&dilations)
        .map(|(&k, &d)| (d.max(1) * (k.max(1) - 1) + 1) as f64)
        .collect()
}
