//! Tensor axis layouts understood by the runtime

use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SegmentationError};

/// Axis order of a network input or output tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    Nhwc,
    Ndhwc,
    Nchw,
    Ncdhw,
}

impl Layout {
    /// Number of spatial axes
    pub fn spatial_ndim(self) -> usize {
        match self {
            Layout::Nhwc | Layout::Nchw => 2,
            Layout::Ndhwc | Layout::Ncdhw => 3,
        }
    }

    pub fn channels_last(self) -> bool {
        matches!(self, Layout::Nhwc | Layout::Ndhwc)
    }

    /// Full tensor shape for a single-channel batch of one
    pub fn input_shape(self, spatial: &[usize]) -> Vec<usize> {
        let mut shape = Vec::with_capacity(spatial.len() + 2);
        shape.push(1);
        if self.channels_last() {
            shape.extend_from_slice(spatial);
            shape.push(1);
        } else {
            shape.push(1);
            shape.extend_from_slice(spatial);
        }
        shape
    }

    /// Add batch and channel axes to a spatial image
    pub fn wrap(self, image: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if image.ndim() != self.spatial_ndim() {
            return Err(SegmentationError::InvalidSettings(format!(
                "layout {} expects {} spatial axes, got shape {:?}",
                self,
                self.spatial_ndim(),
                image.shape()
            )));
        }
        let shape = self.input_shape(image.shape());
        image
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(IxDyn(&shape))
            .map_err(|e| SegmentationError::InvalidSettings(e.to_string()))
    }

    /// Spatial extent of an output tensor with this layout
    pub fn spatial_dims<'a>(self, dims: &'a [usize]) -> Option<&'a [usize]> {
        let n = self.spatial_ndim();
        match dims.len() {
            // Some exports drop the trailing singleton channel
            len if len == n + 1 => Some(&dims[1..]),
            len if len == n + 2 && self.channels_last() => Some(&dims[1..=n]),
            len if len == n + 2 => Some(&dims[2..]),
            _ => None,
        }
    }

    /// Strip the batch axis and return `(*spatial, channels)`
    pub fn unwrap_output(self, output: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let n = self.spatial_ndim();
        let rank = output.ndim();
        if rank != n + 1 && rank != n + 2 {
            return Err(SegmentationError::InvalidOutput(format!(
                "expected a {}D or {}D tensor for layout {}, got shape {:?}",
                n + 1,
                n + 2,
                self,
                output.shape()
            )));
        }
        if output.shape()[0] != 1 {
            return Err(SegmentationError::InvalidOutput(format!(
                "expected batch size 1, got shape {:?}",
                output.shape()
            )));
        }
        let mut out = output.index_axis_move(Axis(0), 0);
        if rank == n + 1 {
            out = out.insert_axis(Axis(n));
        } else if !self.channels_last() {
            // (C, *spatial) -> (*spatial, C)
            let mut axes: Vec<usize> = (1..=n).collect();
            axes.push(0);
            out = out.permuted_axes(IxDyn(&axes));
        }
        Ok(out.as_standard_layout().into_owned())
    }
}

/// Layouts of the network input and its two heads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLayouts {
    pub input: Layout,
    pub prob: Layout,
    pub dist: Layout,
}

impl FromStr for Layout {
    type Err = SegmentationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NHWC" => Ok(Layout::Nhwc),
            "NDHWC" => Ok(Layout::Ndhwc),
            "NCHW" => Ok(Layout::Nchw),
            "NCDHW" => Ok(Layout::Ncdhw),
            other => Err(SegmentationError::InvalidSettings(format!(
                "unsupported layout '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layout::Nhwc => "NHWC",
            Layout::Ndhwc => "NDHWC",
            Layout::Nchw => "NCHW",
            Layout::Ncdhw => "NCDHW",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layouts() {
        assert_eq!("nhwc".parse::<Layout>().unwrap(), Layout::Nhwc);
        assert_eq!("NCDHW".parse::<Layout>().unwrap(), Layout::Ncdhw);
        assert!("NWHC".parse::<Layout>().is_err());
    }

    #[test]
    fn test_input_shape() {
        assert_eq!(Layout::Nhwc.input_shape(&[8, 12]), vec![1, 8, 12, 1]);
        assert_eq!(Layout::Nchw.input_shape(&[8, 12]), vec![1, 1, 8, 12]);
        assert_eq!(Layout::Ndhwc.input_shape(&[4, 8, 12]), vec![1, 4, 8, 12, 1]);
    }

    #[test]
    fn test_wrap_adds_batch_and_channel() {
        let mut image = ArrayD::<f32>::zeros(IxDyn(&[3, 4]));
        image[[2, 1]] = 7.0;
        let nhwc = Layout::Nhwc.wrap(&image).unwrap();
        assert_eq!(nhwc.shape(), &[1, 3, 4, 1]);
        assert_eq!(nhwc[[0, 2, 1, 0]], 7.0);
        assert_eq!(Layout::Nchw.wrap(&image).unwrap().shape(), &[1, 1, 3, 4]);
    }

    #[test]
    fn test_wrap_rejects_wrong_rank() {
        let volume = ArrayD::<f32>::zeros(IxDyn(&[2, 3, 4]));
        assert!(matches!(
            Layout::Nhwc.wrap(&volume),
            Err(SegmentationError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_spatial_dims() {
        assert_eq!(Layout::Nhwc.spatial_dims(&[1, 8, 12, 32]), Some(&[8, 12][..]));
        assert_eq!(Layout::Nchw.spatial_dims(&[1, 32, 8, 12]), Some(&[8, 12][..]));
        assert_eq!(Layout::Nhwc.spatial_dims(&[1, 8, 12]), Some(&[8, 12][..]));
        assert_eq!(Layout::Nhwc.spatial_dims(&[8]), None);
    }

    #[test]
    fn test_unwrap_channels_first() {
        let mut out = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 2, 4]));
        out[[0, 2, 1, 3]] = 5.0;
        let unwrapped = Layout::Nchw.unwrap_output(out).unwrap();
        assert_eq!(unwrapped.shape(), &[2, 4, 3]);
        assert_eq!(unwrapped[[1, 3, 2]], 5.0);
    }

    #[test]
    fn test_unwrap_missing_channel() {
        let out = ArrayD::<f32>::ones(IxDyn(&[1, 5, 6]));
        let unwrapped = Layout::Nhwc.unwrap_output(out).unwrap();
        assert_eq!(unwrapped.shape(), &[5, 6, 1]);
    }

    #[test]
    fn test_unwrap_rejects_wrong_rank() {
        let out = ArrayD::<f32>::ones(IxDyn(&[5, 6]));
        assert!(Layout::Nhwc.unwrap_output(out).is_err());
    }
}
