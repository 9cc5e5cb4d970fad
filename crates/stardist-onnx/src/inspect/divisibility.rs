//! Input divisibility from strided and resampling operators

use std::collections::HashMap;
use tracing::debug;

use super::{constant_values, node_inputs, resample_factors, spatial_attr};
use crate::error::{Result, SegmentationError};
use crate::graph::GraphModel;

/// Per-axis input divisibility implied by the graph's subsampling.
///
/// Walks the nodes in topological order tracking the cumulative stride of
/// every tensor relative to the graph input. Strided convolutions and pools
/// multiply the stride, transposed convolutions and resizes divide it, and
/// every other operator inherits the largest stride among its inputs. The
/// result is the least common multiple of all integral strides reached.
pub fn infer_divisibility(graph: &GraphModel, ndim: usize) -> Result<Vec<usize>> {
    if graph.nodes().is_empty() {
        return Err(SegmentationError::InvalidGraph("graph has no nodes".to_string()));
    }
    let constants = constant_values(graph);
    let mut strides: HashMap<String, Vec<f64>> = graph
        .input_infos()
        .into_iter()
        .map(|input| (input.name, vec![1.0; ndim]))
        .collect();
    if strides.is_empty() {
        return Err(SegmentationError::InvalidGraph("graph has no inputs".to_string()));
    }

    let mut div = vec![1usize; ndim];
    for node in graph.nodes() {
        let Some(incoming) = merge_max(node_inputs(node, &strides)) else {
            continue;
        };
        let outgoing = match node.op_type.as_str() {
            "Conv" | "MaxPool" | "AveragePool" | "LpPool" => {
                let s = spatial_attr(node, "strides", ndim, 1);
                incoming
                    .iter()
                    .zip(&s)
                    .map(|(acc, &s)| acc * s as f64)
                    .collect()
            }
            "ConvTranspose" => {
                let s = spatial_attr(node, "strides", ndim, 1);
                incoming
                    .iter()
                    .zip(&s)
                    .map(|(acc, &s)| acc / s.max(1) as f64)
                    .collect()
            }
            "Resize" | "Upsample" => match resample_factors(node, &constants, ndim) {
                Some(f) => incoming
                    .iter()
                    .zip(&f)
                    .map(|(acc, &f)| if f > 0.0 { acc / f } else { *acc })
                    .collect(),
                None => incoming,
            },
            _ => incoming,
        };

        for (axis, &stride) in outgoing.iter().enumerate() {
            let rounded = stride.round();
            if rounded >= 1.0 && (stride - rounded).abs() < 1e-6 {
                div[axis] = lcm(div[axis], rounded as usize);
            }
        }
        for name in &node.output {
            strides.insert(name.clone(), outgoing.clone());
        }
    }

    debug!("Inferred divisibility {:?}", div);
    Ok(div)
}

fn merge_max(inputs: Vec<&Vec<f64>>) -> Option<Vec<f64>> {
    let mut iter = inputs.into_iter();
    let first = iter.next()?.clone();
    Some(iter.fold(first, |acc, s| {
        acc.iter().zip(s).map(|(a, b)| a.max(*b)).collect()
    }))
}

pub(crate) fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub(crate) fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return a.max(b);
    }
    a / gcd(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::*;

    #[test]
    fn test_lcm_gcd() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(lcm(4, 6), 12);
        assert_eq!(lcm(0, 5), 5);
    }

    #[test]
    fn test_divisibility_of_two_pool_stages() {
        let graph = GraphModel::from_bytes(&unet_like()).unwrap();
        assert_eq!(infer_divisibility(&graph, 2).unwrap(), vec![4, 4]);
    }

    #[test]
    fn test_strided_conv_multiplies() {
        let bytes = encode(
            vec![conv("image", "a", 3, 2), conv("a", "b", 3, 2), conv("b", "c", 3, 2)],
            Vec::new(),
            vec![value_info("image", &[Some(1), None, None, Some(1)])],
            vec![value_info("c", &[Some(1), None, None, Some(8)])],
        );
        let graph = GraphModel::from_bytes(&bytes).unwrap();
        assert_eq!(infer_divisibility(&graph, 2).unwrap(), vec![8, 8]);
    }

    #[test]
    fn test_plain_graph_has_unit_divisibility() {
        let bytes = encode(
            vec![conv("image", "out", 3, 1)],
            Vec::new(),
            vec![value_info("image", &[Some(1), None, None, Some(1)])],
            vec![value_info("out", &[Some(1), None, None, Some(1)])],
        );
        let graph = GraphModel::from_bytes(&bytes).unwrap();
        assert_eq!(infer_divisibility(&graph, 2).unwrap(), vec![1, 1]);
    }
}
