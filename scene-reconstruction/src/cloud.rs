use nalgebra::Point3;
use ply_rs::{
    parser::Parser,
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use rayon::prelude::*;
use std::io::{self, BufRead, Write};

/// A dense point cloud with one RGB color per point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DenseCloud {
    pub points: Vec<Point3<f64>>,
    pub colors: Vec<[u8; 3]>,
}

impl DenseCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: Point3<f64>, color: [u8; 3]) {
        self.points.push(point);
        self.colors.push(color);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Point3<f64>, &[u8; 3])> {
        self.points.iter().zip(&self.colors)
    }

    /// Keeps only the points within `max_distance` of the origin.
    ///
    /// This is a pure predicate on each point, so clipping a clipped cloud again
    /// with the same threshold changes nothing.
    pub fn clipped(&self, max_distance: f64) -> DenseCloud {
        let (points, colors) = self
            .points
            .par_iter()
            .zip(self.colors.par_iter())
            .filter(|(p, _)| p.coords.norm() <= max_distance)
            .map(|(p, c)| (*p, *c))
            .unzip();
        DenseCloud { points, colors }
    }

    /// Writes the cloud as an ascii PLY file with double coordinates and uchar colors.
    pub fn write_ply(&self, mut writer: impl Write) -> io::Result<()> {
        let mut ply = Ply::<DefaultElement>::new();
        ply.header.encoding = Encoding::Ascii;
        ply.header
            .comments
            .push("Exported from scene-reconstruction".to_string());

        let mut point_element = ElementDef::new("vertex".to_string());
        for axis in ["x", "y", "z"] {
            let p = PropertyDef::new(axis.to_string(), PropertyType::Scalar(ScalarType::Double));
            point_element.properties.add(p);
        }
        for channel in ["red", "green", "blue"] {
            let p = PropertyDef::new(channel.to_string(), PropertyType::Scalar(ScalarType::UChar));
            point_element.properties.add(p);
        }
        ply.header.elements.add(point_element);

        let vertices: Vec<_> = self
            .iter()
            .map(|(p, &[r, g, b])| {
                let mut point = DefaultElement::new();
                point.insert("x".to_string(), Property::Double(p.x));
                point.insert("y".to_string(), Property::Double(p.y));
                point.insert("z".to_string(), Property::Double(p.z));
                point.insert("red".to_string(), Property::UChar(r));
                point.insert("green".to_string(), Property::UChar(g));
                point.insert("blue".to_string(), Property::UChar(b));
                point
            })
            .collect();
        ply.payload.insert("vertex".to_string(), vertices);

        Writer::new().write_ply(&mut writer, &mut ply)?;
        Ok(())
    }

    /// Reads a PLY file with `x y z` and optional `red green blue` vertex properties.
    pub fn read_ply(reader: &mut impl BufRead) -> io::Result<DenseCloud> {
        let ply = Parser::<DefaultElement>::new().read_ply(reader)?;
        let mut cloud = DenseCloud::new();
        let Some(vertices) = ply.payload.get("vertex") else {
            return Ok(cloud);
        };
        for vertex in vertices {
            let coordinate = |name: &str| {
                vertex.get(name).and_then(as_f64).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("vertex property {} is missing", name),
                    )
                })
            };
            let channel = |name: &str| match vertex.get(name) {
                Some(Property::UChar(v)) => *v,
                _ => 0,
            };
            cloud.push(
                Point3::new(coordinate("x")?, coordinate("y")?, coordinate("z")?),
                [channel("red"), channel("green"), channel("blue")],
            );
        }
        Ok(cloud)
    }
}

fn as_f64(property: &Property) -> Option<f64> {
    match *property {
        Property::Double(v) => Some(v),
        Property::Float(v) => Some(v as f64),
        _ => None,
    }
}
