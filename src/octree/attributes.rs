use crate::error::Result;
use binrw::binrw;
use bytes::Bytes;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// The closed set of per-node attribute names. Each maps to the blob key of
/// the array holding its payload; the codec is chosen by the name.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum PointAttribute {
    Positions,
    Colors,
    Normals,
    Intensities,
    Classifications,
    KdTree,
    LodPositions,
    LodColors,
    LodNormals,
    LodIntensities,
    LodClassifications,
    LodKdTree,
}

impl PointAttribute {
    /// The LoD counterpart of a node-level attribute.
    pub fn lod(self) -> PointAttribute {
        match self {
            PointAttribute::Positions => PointAttribute::LodPositions,
            PointAttribute::Colors => PointAttribute::LodColors,
            PointAttribute::Normals => PointAttribute::LodNormals,
            PointAttribute::Intensities => PointAttribute::LodIntensities,
            PointAttribute::Classifications => PointAttribute::LodClassifications,
            PointAttribute::KdTree => PointAttribute::LodKdTree,
            other => other,
        }
    }
}

// Length-prefixed little-endian records, one blob struct per payload shape.
// The count is not a struct member; it is recomputed on write.

#[binrw]
#[brw(little)]
struct Vec3Blob {
    #[br(temp)]
    #[bw(try_calc = u32::try_from(data.len()))]
    count: u32,
    #[br(count = count)]
    data: Vec<[f32; 3]>,
}

#[binrw]
#[brw(little)]
struct ColorBlob {
    #[br(temp)]
    #[bw(try_calc = u32::try_from(data.len()))]
    count: u32,
    #[br(count = count)]
    data: Vec<[u8; 4]>,
}

#[binrw]
#[brw(little)]
struct IntensityBlob {
    #[br(temp)]
    #[bw(try_calc = u32::try_from(data.len()))]
    count: u32,
    #[br(count = count)]
    data: Vec<i32>,
}

#[binrw]
#[brw(little)]
struct ClassificationBlob {
    #[br(temp)]
    #[bw(try_calc = u32::try_from(data.len()))]
    count: u32,
    #[br(count = count)]
    data: Vec<u8>,
}

macro_rules! blob_codec {
    ($encode:ident, $decode:ident, $blob:ident, $item:ty, $to_wire:expr, $from_wire:expr) => {
        pub(crate) fn $encode(values: &[$item]) -> Result<Bytes> {
            let blob = $blob {
                data: values.iter().map($to_wire).collect(),
            };
            let mut cursor = std::io::Cursor::new(Vec::new());
            binrw::BinWrite::write_le(&blob, &mut cursor)?;
            Ok(Bytes::from(cursor.into_inner()))
        }

        pub(crate) fn $decode(bytes: &[u8]) -> Result<Vec<$item>> {
            use binrw::BinReaderExt;
            let blob: $blob = std::io::Cursor::new(bytes).read_le()?;
            Ok(blob.data.into_iter().map($from_wire).collect())
        }
    };
}

blob_codec!(
    encode_vec3s,
    decode_vec3s,
    Vec3Blob,
    Vec3,
    |v: &Vec3| (*v).into(),
    Vec3::from
);
blob_codec!(
    encode_colors,
    decode_colors,
    ColorBlob,
    [u8; 4],
    |v: &[u8; 4]| *v,
    |v| v
);
blob_codec!(
    encode_intensities,
    decode_intensities,
    IntensityBlob,
    i32,
    |v: &i32| *v,
    |v| v
);
blob_codec!(
    encode_classifications,
    decode_classifications,
    ClassificationBlob,
    u8,
    |v: &u8| *v,
    |v| v
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_roundtrip_exactly() {
        let values = vec![
            Vec3::new(0.5, -1.25, 3.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(f32::MIN_POSITIVE, 1e20, -7.5),
        ];
        let bytes = encode_vec3s(&values).unwrap();
        // count prefix + 3 floats per record
        assert_eq!(bytes.len(), 4 + values.len() * 12);
        assert_eq!(decode_vec3s(&bytes).unwrap(), values);
    }

    #[test]
    fn scalar_blobs_roundtrip() {
        let colors = vec![[0u8, 128, 255, 255], [1, 2, 3, 4]];
        assert_eq!(
            decode_colors(&encode_colors(&colors).unwrap()).unwrap(),
            colors
        );
        let intensities = vec![-5, 0, i32::MAX];
        assert_eq!(
            decode_intensities(&encode_intensities(&intensities).unwrap()).unwrap(),
            intensities
        );
        let classes = vec![0u8, 17, 255];
        assert_eq!(
            decode_classifications(&encode_classifications(&classes).unwrap()).unwrap(),
            classes
        );
    }

    #[test]
    fn truncated_blob_is_an_error() {
        let bytes = encode_vec3s(&[Vec3::ONE, Vec3::ZERO]).unwrap();
        assert!(decode_vec3s(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn lod_mapping() {
        assert_eq!(
            PointAttribute::Positions.lod(),
            PointAttribute::LodPositions
        );
        assert_eq!(PointAttribute::KdTree.lod(), PointAttribute::LodKdTree);
        assert_eq!(
            PointAttribute::LodColors.lod(),
            PointAttribute::LodColors
        );
    }
}
