use crate::model::WeightBlob;
use std::borrow::Cow;

/// Dense `f32` weight tensor, borrowed straight from the graph when it passes through untouched
/// and owned once a transform rewrites it.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorView<'a> {
    pub data: Cow<'a, [f32]>,
    pub shape: Cow<'a, [usize]>,
}

impl<'a> TensorView<'a> {
    pub fn from_owned(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        assert_eq!(data.len(), len, "Data length mismatch");
        Self {
            data: Cow::Owned(data),
            shape: Cow::Owned(shape),
        }
    }

    /// Borrows a graph weight blob. The graph must have passed `NetworkGraph::validate`.
    pub fn from_blob(blob: &'a WeightBlob) -> Self {
        let shape: Vec<usize> = blob.shape.iter().map(|&d| d.max(0) as usize).collect();
        Self::from_slice(&blob.data, shape)
    }

    pub fn from_slice(data: &'a [f32], shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        assert_eq!(data.len(), len, "Data length mismatch");
        Self {
            data: Cow::Borrowed(data),
            shape: Cow::Owned(shape),
        }
    }

    pub fn zeros(shape: Vec<usize>) -> TensorView<'static> {
        let len = shape.iter().product();
        TensorView::from_owned(vec![0.0; len], shape)
    }

    pub fn to_owned(&self) -> TensorView<'static> {
        TensorView::from_owned(self.data.to_vec(), self.shape.to_vec())
    }

    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self, dim: usize) -> usize {
        self.shape[dim]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Elements per slice along axis 0.
    pub fn row_len(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape[1..].iter().product()
        }
    }

    /// Serialized size in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Little-endian `f32` bytes in row-major order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for v in self.data.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_bytes() {
        let t = TensorView::from_owned(vec![1.0, -2.0], vec![2]);
        let bytes = t.to_le_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..], &(-2.0f32).to_le_bytes());
    }

    #[test]
    fn test_from_blob_borrows() {
        let blob = WeightBlob {
            shape: vec![2, 3],
            data: vec![0.0; 6],
        };
        let t = TensorView::from_blob(&blob);
        assert!(matches!(t.data, Cow::Borrowed(_)));
        assert_eq!(t.row_len(), 3);
        assert_eq!(t.size(0), 2);
        assert_eq!(t.byte_len(), 24);
    }
}
