//! Layer graph hand-off format.
//!
//! The network description arrives as protobuf messages declared here with `prost` derive, so no
//! schema compilation step is needed. Weight tensors travel inline as `f32` data plus shape.
use ::prost::DecodeError;
use ::prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error")]
    Io(#[from] std::io::Error),
    #[error("Protobuf decode error")]
    Decode(#[from] DecodeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid tensor data in layer `{layer}`: {reason}")]
    InvalidTensor { layer: String, reason: String },
}

#[derive(Clone, PartialEq, Message)]
pub struct NetworkGraph {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub layers: Vec<LayerNode>,
    /// Comma separated, optionally bracketed, e.g. `"[car, pedestrian]"`.
    #[prost(string, tag = "3")]
    pub class_names: String,
    #[prost(string, tag = "4")]
    pub class_thresholds: String,
    #[prost(message, repeated, tag = "5")]
    pub blob_shapes: Vec<BlobShape>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BlobShape {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, repeated, tag = "2")]
    pub dims: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WeightBlob {
    #[prost(int64, repeated, tag = "1")]
    pub shape: Vec<i64>,
    #[prost(float, repeated, tag = "2")]
    pub data: Vec<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LayerNode {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub kind: String,
    #[prost(string, repeated, tag = "3")]
    pub inputs: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub outputs: Vec<String>,
    #[prost(message, repeated, tag = "5")]
    pub weights: Vec<WeightBlob>,
    #[prost(message, optional, tag = "10")]
    pub convolution: Option<ConvolutionParam>,
    #[prost(message, optional, tag = "11")]
    pub pooling: Option<PoolingParam>,
    #[prost(message, optional, tag = "12")]
    pub roi_pooling: Option<RoiPoolingParam>,
    #[prost(message, optional, tag = "13")]
    pub eltwise: Option<EltwiseParam>,
    #[prost(message, optional, tag = "14")]
    pub reshape: Option<ReshapeParam>,
    #[prost(message, optional, tag = "15")]
    pub slice: Option<SliceParam>,
    #[prost(message, optional, tag = "16")]
    pub slice_concat: Option<SliceConcatParam>,
    #[prost(message, optional, tag = "17")]
    pub concat: Option<ConcatParam>,
    #[prost(message, optional, tag = "18")]
    pub batch_norm: Option<BatchNormParam>,
    #[prost(message, optional, tag = "19")]
    pub scale: Option<ScaleParam>,
    #[prost(message, optional, tag = "20")]
    pub inner_product: Option<InnerProductParam>,
    #[prost(message, optional, tag = "21")]
    pub proposal_nway: Option<ProposalNwayParam>,
    #[prost(message, optional, tag = "22")]
    pub detection: Option<DetectionParam>,
    #[prost(message, optional, tag = "23")]
    pub post_detection: Option<PostDetectionParam>,
    #[prost(message, optional, tag = "24")]
    pub quantization: Option<QuantizationParam>,
    #[prost(message, optional, tag = "25")]
    pub resample: Option<ResampleParam>,
    #[prost(message, optional, tag = "26")]
    pub roi_data: Option<RoiDataParam>,
    #[prost(message, optional, tag = "27")]
    pub stixel_pooling: Option<StixelPoolingParam>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConvolutionParam {
    #[prost(uint32, tag = "1")]
    pub num_output: u32,
    #[prost(bool, optional, tag = "2", default = "true")]
    pub bias_term: Option<bool>,
    #[prost(uint32, repeated, tag = "3")]
    pub pad: Vec<u32>,
    #[prost(uint32, repeated, tag = "4")]
    pub kernel_size: Vec<u32>,
    #[prost(uint32, optional, tag = "5", default = "1")]
    pub group: Option<u32>,
    #[prost(uint32, repeated, tag = "6")]
    pub stride: Vec<u32>,
    /// Filler type name used at training time (`constant`, `bilinear`, ...).
    #[prost(string, tag = "7")]
    pub weight_filler: String,
    #[prost(uint32, tag = "9")]
    pub pad_h: u32,
    #[prost(uint32, tag = "10")]
    pub pad_w: u32,
    #[prost(uint32, tag = "13")]
    pub stride_h: u32,
    #[prost(uint32, tag = "14")]
    pub stride_w: u32,
    #[prost(uint32, repeated, tag = "18")]
    pub dilation: Vec<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PoolingParam {
    /// 0 = MAX, 1 = AVE, 2 = STOCHASTIC
    #[prost(uint32, tag = "1")]
    pub pool: u32,
    #[prost(uint32, tag = "2")]
    pub kernel_size: u32,
    #[prost(uint32, optional, tag = "3", default = "1")]
    pub stride: Option<u32>,
    #[prost(uint32, tag = "4")]
    pub pad: u32,
    #[prost(bool, tag = "12")]
    pub global_pooling: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct StixelPoolingParam {
    #[prost(uint32, tag = "1")]
    pub pool: u32,
    #[prost(bool, tag = "2")]
    pub global_pooling_h: bool,
    #[prost(uint32, tag = "3")]
    pub pad_h: u32,
    #[prost(uint32, tag = "4")]
    pub stride_h: u32,
    #[prost(uint32, tag = "5")]
    pub bin_h: u32,
    #[prost(uint32, tag = "6")]
    pub kernel_h: u32,
    #[prost(bool, tag = "7")]
    pub global_pooling_w: bool,
    #[prost(uint32, tag = "8")]
    pub pad_w: u32,
    #[prost(uint32, tag = "9")]
    pub stride_w: u32,
    #[prost(uint32, tag = "10")]
    pub bin_w: u32,
    #[prost(uint32, tag = "11")]
    pub kernel_w: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct RoiPoolingParam {
    #[prost(uint32, tag = "1")]
    pub pooled_h: u32,
    #[prost(uint32, tag = "2")]
    pub pooled_w: u32,
    #[prost(float, optional, tag = "3", default = "1")]
    pub spatial_scale: Option<f32>,
    /// 0 = MAX, 1 = AVE, 2 = ALIGN_MAX
    #[prost(uint32, tag = "4")]
    pub pool: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct EltwiseParam {
    /// 0 = PROD, 1 = SUM, 2 = MAX
    #[prost(uint32, optional, tag = "1", default = "1")]
    pub operation: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReshapeParam {
    #[prost(int64, repeated, tag = "1")]
    pub dims: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SliceParam {
    #[prost(int32, optional, tag = "1", default = "1")]
    pub axis: Option<i32>,
    #[prost(uint32, repeated, tag = "2")]
    pub slice_points: Vec<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SliceConcatParam {
    #[prost(uint32, tag = "1")]
    pub nslices: u32,
    #[prost(int32, tag = "2")]
    pub slice_axis: i32,
    #[prost(int32, tag = "3")]
    pub concat_axis: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConcatParam {
    #[prost(int32, optional, tag = "1", default = "1")]
    pub axis: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BatchNormParam {
    #[prost(float, optional, tag = "1", default = "0.00001")]
    pub eps: Option<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ScaleParam {
    #[prost(bool, tag = "1")]
    pub bias_term: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct InnerProductParam {
    #[prost(uint32, tag = "1")]
    pub num_output: u32,
    #[prost(bool, optional, tag = "2", default = "true")]
    pub bias_term: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpnOption {
    /// Nested list text such as `"[[0.5, 1, 2]]"`.
    #[prost(string, tag = "1")]
    pub ratios: String,
    #[prost(string, tag = "2")]
    pub scales: String,
    #[prost(uint32, tag = "3")]
    pub base_size: u32,
    #[prost(uint32, tag = "4")]
    pub feat_stride: u32,
    #[prost(uint32, tag = "5")]
    pub min_size: u32,
    #[prost(uint32, tag = "6")]
    pub max_size: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProposalNwayParam {
    #[prost(message, repeated, tag = "1")]
    pub rpn_option: Vec<RpnOption>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DetectionParam {
    #[prost(string, tag = "1")]
    pub class_map: String,
    #[prost(message, repeated, tag = "2")]
    pub rpn_option: Vec<RpnOption>,
    #[prost(float, tag = "3")]
    pub mean_dx: f32,
    #[prost(float, tag = "4")]
    pub mean_dy: f32,
    #[prost(float, tag = "5")]
    pub mean_dw: f32,
    #[prost(float, tag = "6")]
    pub mean_dh: f32,
    #[prost(float, tag = "7")]
    pub std_dx: f32,
    #[prost(float, tag = "8")]
    pub std_dy: f32,
    #[prost(float, tag = "9")]
    pub std_dw: f32,
    #[prost(float, tag = "10")]
    pub std_dh: f32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PostDetectionParam {
    #[prost(string, tag = "1")]
    pub attribute_group: String,
    #[prost(string, tag = "2")]
    pub regression_group: String,
    #[prost(uint32, tag = "3")]
    pub num_shape: u32,
    #[prost(uint32, tag = "4")]
    pub num_pts: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct QuantizationParam {
    #[prost(int32, tag = "1")]
    pub fl_params: i32,
    #[prost(int32, tag = "2")]
    pub bw_params: i32,
    #[prost(int32, optional, tag = "3")]
    pub fl_params_bias: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub bw_params_bias: Option<i32>,
}

/// Shared by Upsample, Space2Depth and Depth2Space.
#[derive(Clone, PartialEq, Message)]
pub struct ResampleParam {
    #[prost(uint32, optional, tag = "1", default = "2")]
    pub scale: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RoiDataParam {
    #[prost(uint32, optional, tag = "1", default = "1")]
    pub multiple: Option<u32>,
    #[prost(float, tag = "2")]
    pub mean0: f32,
    #[prost(float, tag = "3")]
    pub mean1: f32,
    #[prost(float, tag = "4")]
    pub mean2: f32,
}

/// Closed set of operator kinds the compiler understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LayerKind {
    RoiData,
    RoiPooling,
    PsRoiPooling,
    Concat,
    ProposalSlice,
    Convolution,
    ConvolutionRistretto,
    FusedConvBatchNorm,
    FusedConvBatchNormRistretto,
    ConvolutionDepthwise,
    Deconvolution,
    DeconvolutionRistretto,
    InnerProduct,
    FcRistretto,
    BinaryInnerProduct,
    FusedBinaryFcBatchNorm,
    FusedBinaryFcBatchNormRistretto,
    BatchNorm,
    Scale,
    CRelu,
    Relu,
    ERelu,
    Elu,
    Mish,
    Eltwise,
    Pooling,
    StixelPooling,
    Slice,
    SliceConcat,
    Reshape,
    Softmax,
    Sigmoid,
    Detection,
    Detection3D,
    PostDetection,
    Segmentation,
    CurveFitting,
    Space2Depth,
    Depth2Space,
    QuantizedMaskPooling,
    Upsample,
    Split,
    ProposalNway,
    Quantize,
    Unknown(String),
}

impl LayerKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "ROIData" => Self::RoiData,
            "ROIPooling" => Self::RoiPooling,
            "PSROIPooling" => Self::PsRoiPooling,
            "Concat" => Self::Concat,
            "ProposalSlice" => Self::ProposalSlice,
            "Convolution" => Self::Convolution,
            "ConvolutionRistretto" => Self::ConvolutionRistretto,
            "FusedConvBatchNorm" => Self::FusedConvBatchNorm,
            "FusedConvBatchNormRistretto" => Self::FusedConvBatchNormRistretto,
            "ConvolutionDepthwise" => Self::ConvolutionDepthwise,
            "Deconvolution" => Self::Deconvolution,
            "DeconvolutionRistretto" => Self::DeconvolutionRistretto,
            "InnerProduct" => Self::InnerProduct,
            "FcRistretto" => Self::FcRistretto,
            "BinaryInnerProduct" => Self::BinaryInnerProduct,
            "FusedBinaryFcBatchNorm" => Self::FusedBinaryFcBatchNorm,
            "FusedBinaryFcBatchNormRistretto" => Self::FusedBinaryFcBatchNormRistretto,
            "BatchNorm" => Self::BatchNorm,
            "Scale" => Self::Scale,
            "CReLU" => Self::CRelu,
            "ReLU" => Self::Relu,
            "EReLU" => Self::ERelu,
            "ELU" => Self::Elu,
            "Mish" => Self::Mish,
            "Eltwise" => Self::Eltwise,
            "Pooling" => Self::Pooling,
            "StixelPooling" => Self::StixelPooling,
            "Slice" => Self::Slice,
            "SliceConcat" => Self::SliceConcat,
            "Reshape" => Self::Reshape,
            "Softmax" => Self::Softmax,
            "Sigmoid" => Self::Sigmoid,
            "Detection" => Self::Detection,
            "Detection3D" => Self::Detection3D,
            "PostDetection" => Self::PostDetection,
            "Segmentation" => Self::Segmentation,
            "CurveFitting" => Self::CurveFitting,
            "Space2Depth" => Self::Space2Depth,
            "Depth2Space" => Self::Depth2Space,
            "QuantizedMaskPooling" => Self::QuantizedMaskPooling,
            "Upsample" => Self::Upsample,
            "Split" => Self::Split,
            "ProposalNway" => Self::ProposalNway,
            "Quantize" => Self::Quantize,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Convolution kinds that can anchor a conv pattern.
    pub fn is_conv(&self) -> bool {
        matches!(
            self,
            Self::Convolution
                | Self::ConvolutionRistretto
                | Self::FusedConvBatchNorm
                | Self::FusedConvBatchNormRistretto
                | Self::ConvolutionDepthwise
        )
    }

    pub fn is_deconv(&self) -> bool {
        matches!(self, Self::Deconvolution | Self::DeconvolutionRistretto)
    }

    pub fn is_fc(&self) -> bool {
        matches!(
            self,
            Self::InnerProduct
                | Self::FcRistretto
                | Self::BinaryInnerProduct
                | Self::FusedBinaryFcBatchNorm
                | Self::FusedBinaryFcBatchNormRistretto
        )
    }

    /// Kinds that carry their own batch-norm statistics in blobs 1..=5.
    pub fn is_fused(&self) -> bool {
        matches!(
            self,
            Self::FusedConvBatchNorm
                | Self::FusedConvBatchNormRistretto
                | Self::FusedBinaryFcBatchNorm
                | Self::FusedBinaryFcBatchNormRistretto
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            Self::BinaryInnerProduct
                | Self::FusedBinaryFcBatchNorm
                | Self::FusedBinaryFcBatchNormRistretto
        )
    }

    pub fn is_ristretto(&self) -> bool {
        matches!(
            self,
            Self::ConvolutionRistretto
                | Self::FusedConvBatchNormRistretto
                | Self::DeconvolutionRistretto
                | Self::FcRistretto
                | Self::FusedBinaryFcBatchNormRistretto
        )
    }
}

impl LayerNode {
    pub fn op(&self) -> LayerKind {
        LayerKind::parse(&self.kind)
    }

    pub fn conv_param(&self) -> ConvolutionParam {
        self.convolution.clone().unwrap_or_default()
    }

    pub fn pooling_param(&self) -> PoolingParam {
        self.pooling.clone().unwrap_or_default()
    }

    pub fn roi_param(&self) -> RoiPoolingParam {
        self.roi_pooling.clone().unwrap_or_default()
    }

    pub fn eltwise_operation(&self) -> u32 {
        self.eltwise.as_ref().map_or(1, |e| e.operation())
    }

    pub fn resample_scale(&self) -> u32 {
        self.resample.as_ref().map_or(2, |r| r.scale())
    }

    pub fn fc_param(&self) -> InnerProductParam {
        self.inner_product.clone().unwrap_or_default()
    }

    /// Declared bias flag of a conv, deconv or fc layer.
    pub fn bias_term(&self) -> bool {
        let kind = self.op();
        if kind.is_fc() {
            self.fc_param().bias_term()
        } else if kind == LayerKind::Scale {
            self.scale.as_ref().is_some_and(|s| s.bias_term)
        } else {
            self.conv_param().bias_term()
        }
    }

    /// Output channel count declared by a conv or fc layer.
    pub fn num_output(&self) -> u32 {
        if self.op().is_fc() {
            self.fc_param().num_output
        } else {
            self.conv_param().num_output
        }
    }

    pub fn weight_shape(&self, index: usize) -> Option<Vec<usize>> {
        self.weights
            .get(index)
            .map(|b| b.shape.iter().map(|&d| d.max(0) as usize).collect())
    }
}

impl NetworkGraph {
    pub fn position(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    pub fn layer(&self, name: &str) -> Option<&LayerNode> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn blob_shape(&self, blob: &str) -> Option<&[i64]> {
        self.blob_shapes
            .iter()
            .find(|b| b.name == blob)
            .map(|b| b.dims.as_slice())
    }

    /// Channel count (dim 1) of a blob, when shapes were recorded.
    pub fn channels(&self, blob: &str) -> Option<i64> {
        self.blob_shape(blob).and_then(|d| d.get(1).copied())
    }

    /// Checks every weight blob's data length against its declared shape.
    pub fn validate(&self) -> Result<(), ModelError> {
        for layer in &self.layers {
            for (i, blob) in layer.weights.iter().enumerate() {
                if blob.shape.iter().any(|&d| d < 0) {
                    return Err(ModelError::InvalidTensor {
                        layer: layer.name.clone(),
                        reason: format!("blob {} has a negative dimension", i),
                    });
                }
                let expected = blob
                    .shape
                    .iter()
                    .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
                    .ok_or_else(|| ModelError::InvalidTensor {
                        layer: layer.name.clone(),
                        reason: format!("blob {} shape {:?} overflows", i, blob.shape),
                    })?;
                if expected != blob.data.len() {
                    return Err(ModelError::InvalidTensor {
                        layer: layer.name.clone(),
                        reason: format!(
                            "blob {} declares {} elements but holds {}",
                            i,
                            expected,
                            blob.data.len()
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Reads and decodes a serialized [`NetworkGraph`].
pub fn load_graph<P: AsRef<Path>>(path: P) -> Result<NetworkGraph, ModelError> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let graph = NetworkGraph::decode(&buffer[..])?;
    graph.validate()?;
    Ok(graph)
}

/// One entry of the quantization side table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Shift {
    Bits(i32),
    /// Written as `"INVALID_SHIFT"`.
    Invalid(String),
}

impl Shift {
    pub fn bits(&self) -> Option<i32> {
        match self {
            Shift::Bits(b) => Some(*b),
            Shift::Invalid(_) => None,
        }
    }
}

/// Blob name to fractional-bit count of the int8 activations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuantizeInfo {
    pub shifts: BTreeMap<String, Shift>,
}

impl QuantizeInfo {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn shift(&self, blob: &str) -> Option<i32> {
        self.shifts.get(blob).and_then(Shift::bits)
    }
}
