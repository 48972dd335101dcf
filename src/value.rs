//! The closed set of value kinds a [`crate::Attribute`] may hold.
//!
//! A value is exactly one scalar kind, or a homogeneous array of one scalar
//! kind. Nested arrays and untyped "any" values are not representable —
//! `Value` is a flat tagged sum, one variant per kind, mirroring the shape
//! the wire formats themselves use (a single type byte per attribute).

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::element::ElementHandle;
use crate::element_array::ElementArray;
use crate::error::Error;

/// RGBA color, one byte per channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

impl Display for Color {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.r, self.g, self.b, self.a)
    }
}

impl FromStr for Color {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = split_components(s);
        let r = next_component(&mut parts, "Color")?;
        let g = next_component(&mut parts, "Color")?;
        let b = next_component(&mut parts, "Color")?;
        let a = next_component(&mut parts, "Color")?;
        Ok(Self { r, g, b, a })
    }
}

/// Splits on whitespace or comma, matching culture-sensitive writers that
/// use either as a list separator. Parsing is intentionally
/// locale-independent in this rewrite (see spec's Design Notes on culture
/// sensitivity).
fn split_components(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| c.is_whitespace() || c == ',').filter(|s| !s.is_empty())
}

fn next_component<'a, T: FromStr>(parts: &mut impl Iterator<Item = &'a str>, kind: &str) -> Result<T, Error> {
    parts
        .next()
        .ok_or_else(|| Error::ValueDomain(format!("{kind}: not enough components")))
        .and_then(|part| part.parse::<T>().map_err(|_| Error::ValueDomain(format!("{kind}: failed to parse component"))))
}

macro_rules! vector_type {
    ($name:ident { $($field:ident),+ }, $count:literal) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq)]
        pub struct $name {
            $(pub $field: f32,)+
        }

        impl $name {
            /// Builds from exactly `
            #[doc = stringify!($count)]
            #[doc = "` components; fewer or more is a domain error."]
            pub fn from_components(components: &[f32]) -> Result<Self, Error> {
                if components.len() != $count {
                    return Err(Error::ValueDomain(format!(
                        concat!(stringify!($name), " requires exactly {} components, got {}"),
                        $count,
                        components.len()
                    )));
                }
                let mut iter = components.iter().copied();
                Ok(Self { $($field: iter.next().unwrap(),)+ })
            }

            fn components(&self) -> [f32; $count] {
                [$(self.$field),+]
            }

            pub fn normalise(&mut self) {
                let len: f32 = self.components().iter().map(|c| c * c).sum::<f32>().sqrt();
                if len != 0.0 {
                    $(self.$field /= len;)+
                }
            }

            pub fn normalised(mut self) -> Self {
                self.normalise();
                self
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                let parts: Vec<String> = self.components().iter().map(|c| c.to_string()).collect();
                f.write_str(&parts.join(" "))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let components: Result<Vec<f32>, Error> = split_components(s)
                    .map(|part| part.parse::<f32>().map_err(|_| Error::ValueDomain(format!(concat!(stringify!($name), ": failed to parse component")))))
                    .collect();
                Self::from_components(&components?)
            }
        }

        impl std::ops::Add for $name {
            type Output = Self;
            fn add(self, rhs: Self) -> Self {
                Self { $($field: self.$field + rhs.$field,)+ }
            }
        }

        impl std::ops::Sub for $name {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self {
                Self { $($field: self.$field - rhs.$field,)+ }
            }
        }

        impl std::ops::Mul<f32> for $name {
            type Output = Self;
            fn mul(self, rhs: f32) -> Self {
                Self { $($field: self.$field * rhs,)+ }
            }
        }

        impl std::ops::Div<f32> for $name {
            type Output = Self;
            fn div(self, rhs: f32) -> Self {
                Self { $($field: self.$field / rhs,)+ }
            }
        }
    };
}

vector_type!(Vector2 { x, y }, 2);
vector_type!(Vector3 { x, y, z }, 3);
vector_type!(Vector4 { x, y, z, w }, 4);
vector_type!(Quaternion { x, y, z, w }, 4);

/// Tait-Bryan pitch/yaw/roll, in degrees. Structurally a [`Vector3`] but a
/// distinct attribute kind (spec §3).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Angle {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

impl Angle {
    pub fn from_components(components: &[f32]) -> Result<Self, Error> {
        let v = Vector3::from_components(components)?;
        Ok(Self { pitch: v.x, yaw: v.y, roll: v.z })
    }
}

impl Display for Angle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.pitch, self.yaw, self.roll)
    }
}

impl FromStr for Angle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v: Vector3 = s.parse()?;
        Ok(Self { pitch: v.x, yaw: v.y, roll: v.z })
    }
}

/// Row-major 4x4 transform matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Matrix4(pub [[f32; 4]; 4]);

impl Matrix4 {
    pub const IDENTITY: Self = Self([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    /// Builds a matrix from exactly 16 row-major floats; anything else is a
    /// domain error (spec §8 boundary behavior: a 15-float sequence fails).
    pub fn from_components(components: &[f32]) -> Result<Self, Error> {
        if components.len() != 16 {
            return Err(Error::ValueDomain(format!("Matrix4 requires exactly 16 components, got {}", components.len())));
        }
        let mut rows = [[0.0f32; 4]; 4];
        for (i, chunk) in components.chunks_exact(4).enumerate() {
            rows[i].copy_from_slice(chunk);
        }
        Ok(Self(rows))
    }
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Display for Matrix4 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rows: Vec<String> = self.0.iter().map(|row| row.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(" ")).collect();
        f.write_str(&rows.join("  "))
    }
}

impl FromStr for Matrix4 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components: Result<Vec<f32>, Error> =
            split_components(s).map(|part| part.parse::<f32>().map_err(|_| Error::ValueDomain("Matrix4: failed to parse component".into()))).collect();
        Self::from_components(&components?)
    }
}

macro_rules! mint_interop {
    ($name:ident, $mint:path, { $($field:ident),+ }) => {
        impl From<$mint> for $name {
            fn from(value: $mint) -> Self {
                Self { $($field: value.$field,)+ }
            }
        }

        impl From<$name> for $mint {
            fn from(value: $name) -> Self {
                Self { $($field: value.$field,)+ }
            }
        }
    };
}

mint_interop!(Vector2, mint::Vector2<f32>, { x, y });
mint_interop!(Vector3, mint::Vector3<f32>, { x, y, z });
mint_interop!(Vector4, mint::Vector4<f32>, { x, y, z, w });

impl From<mint::Quaternion<f32>> for Quaternion {
    fn from(value: mint::Quaternion<f32>) -> Self {
        Self { x: value.v.x, y: value.v.y, z: value.v.z, w: value.s }
    }
}

impl From<Quaternion> for mint::Quaternion<f32> {
    fn from(value: Quaternion) -> Self {
        Self { v: mint::Vector3 { x: value.x, y: value.y, z: value.z }, s: value.w }
    }
}

impl From<mint::RowMatrix4<f32>> for Matrix4 {
    fn from(value: mint::RowMatrix4<f32>) -> Self {
        Self([value.x.into(), value.y.into(), value.z.into(), value.w.into()])
    }
}

impl From<Matrix4> for mint::RowMatrix4<f32> {
    fn from(value: Matrix4) -> Self {
        Self {
            x: value.0[0].into(),
            y: value.0[1].into(),
            z: value.0[2].into(),
            w: value.0[3].into(),
        }
    }
}

/// A single attribute value, or a homogeneous array of one kind.
///
/// `Element` and `ElementArray` carry graph references rather than owned
/// data (see [`crate::element`]); every other variant is plain data.
#[derive(Clone, Debug)]
pub enum Value {
    Element(Option<ElementHandle>),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Binary(Vec<u8>),
    TimeSpan(chrono::Duration),
    Color(Color),
    Vector2(Vector2),
    Vector3(Vector3),
    Vector4(Vector4),
    Angle(Angle),
    Quaternion(Quaternion),
    Matrix4(Matrix4),

    ElementArray(ElementArray),
    Int32Array(Vec<i32>),
    Float32Array(Vec<f32>),
    BoolArray(Vec<bool>),
    StringArray(Vec<String>),
    BinaryArray(Vec<Vec<u8>>),
    TimeSpanArray(Vec<chrono::Duration>),
    ColorArray(Vec<Color>),
    Vector2Array(Vec<Vector2>),
    Vector3Array(Vec<Vector3>),
    Vector4Array(Vec<Vector4>),
    AngleArray(Vec<Angle>),
    QuaternionArray(Vec<Quaternion>),
    Matrix4Array(Vec<Matrix4>),
}

impl Value {
    /// The kind name as used in the keyvalues2 text form and in error
    /// messages. This is the `isDatamodelType` predicate's positive half —
    /// every `Value` constructed through this enum is by construction a
    /// legal kind; there is no way to name an illegal one.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Element(_) => "element",
            Value::Int32(_) => "int",
            Value::Float32(_) => "float",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::TimeSpan(_) => "time",
            Value::Color(_) => "color",
            Value::Vector2(_) => "vector2",
            Value::Vector3(_) => "vector3",
            Value::Vector4(_) => "vector4",
            Value::Angle(_) => "qangle",
            Value::Quaternion(_) => "quaternion",
            Value::Matrix4(_) => "matrix",
            Value::ElementArray(_) => "element_array",
            Value::Int32Array(_) => "int_array",
            Value::Float32Array(_) => "float_array",
            Value::BoolArray(_) => "bool_array",
            Value::StringArray(_) => "string_array",
            Value::BinaryArray(_) => "binary_array",
            Value::TimeSpanArray(_) => "time_array",
            Value::ColorArray(_) => "color_array",
            Value::Vector2Array(_) => "vector2_array",
            Value::Vector3Array(_) => "vector3_array",
            Value::Vector4Array(_) => "vector4_array",
            Value::AngleArray(_) => "qangle_array",
            Value::QuaternionArray(_) => "quaternion_array",
            Value::Matrix4Array(_) => "matrix_array",
        }
    }

    /// True for the array variants (`ElementArray` included).
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Value::ElementArray(_)
                | Value::Int32Array(_)
                | Value::Float32Array(_)
                | Value::BoolArray(_)
                | Value::StringArray(_)
                | Value::BinaryArray(_)
                | Value::TimeSpanArray(_)
                | Value::ColorArray(_)
                | Value::Vector2Array(_)
                | Value::Vector3Array(_)
                | Value::Vector4Array(_)
                | Value::AngleArray(_)
                | Value::QuaternionArray(_)
                | Value::Matrix4Array(_)
        )
    }
}

/// Declares the bidirectional conversions between a Rust type and its
/// [`Value`] scalar/array variant pair, mirroring the teacher's
/// `declare_attribute!` macro in `attribute.rs`.
macro_rules! declare_value {
    ($qualifier:ty, $scalar:path, $array:path) => {
        impl From<$qualifier> for Value {
            fn from(value: $qualifier) -> Self {
                $scalar(value)
            }
        }

        impl TryFrom<Value> for $qualifier {
            type Error = Error;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    $scalar(value) => Ok(value),
                    other => Err(Error::AttributeType { name: other.kind_name().to_string() }),
                }
            }
        }

        impl<'a> TryFrom<&'a Value> for &'a $qualifier {
            type Error = Error;

            fn try_from(value: &'a Value) -> Result<Self, Self::Error> {
                match value {
                    $scalar(value) => Ok(value),
                    other => Err(Error::AttributeType { name: other.kind_name().to_string() }),
                }
            }
        }

        impl From<Vec<$qualifier>> for Value {
            fn from(value: Vec<$qualifier>) -> Self {
                $array(value)
            }
        }

        impl TryFrom<Value> for Vec<$qualifier> {
            type Error = Error;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    $array(value) => Ok(value),
                    other => Err(Error::AttributeType { name: other.kind_name().to_string() }),
                }
            }
        }

        impl<'a> TryFrom<&'a Value> for &'a Vec<$qualifier> {
            type Error = Error;

            fn try_from(value: &'a Value) -> Result<Self, Self::Error> {
                match value {
                    $array(value) => Ok(value),
                    other => Err(Error::AttributeType { name: other.kind_name().to_string() }),
                }
            }
        }
    };
}

declare_value!(i32, Value::Int32, Value::Int32Array);
declare_value!(f32, Value::Float32, Value::Float32Array);
declare_value!(bool, Value::Bool, Value::BoolArray);
declare_value!(String, Value::String, Value::StringArray);
declare_value!(Vec<u8>, Value::Binary, Value::BinaryArray);
declare_value!(chrono::Duration, Value::TimeSpan, Value::TimeSpanArray);
declare_value!(Color, Value::Color, Value::ColorArray);
declare_value!(Vector2, Value::Vector2, Value::Vector2Array);
declare_value!(Vector3, Value::Vector3, Value::Vector3Array);
declare_value!(Vector4, Value::Vector4, Value::Vector4Array);
declare_value!(Angle, Value::Angle, Value::AngleArray);
declare_value!(Quaternion, Value::Quaternion, Value::QuaternionArray);
declare_value!(Matrix4, Value::Matrix4, Value::Matrix4Array);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector3_rejects_wrong_arity() {
        assert!(Vector3::from_components(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn matrix4_rejects_15_floats() {
        let components: Vec<f32> = (0..15).map(|i| i as f32).collect();
        assert!(matches!(Matrix4::from_components(&components), Err(Error::ValueDomain(_))));
    }

    #[test]
    fn matrix4_accepts_16_floats() {
        let components: Vec<f32> = (0..16).map(|i| i as f32).collect();
        assert!(Matrix4::from_components(&components).is_ok());
    }

    #[test]
    fn vector3_display_joins_with_space() {
        let v = Vector3 { x: 1.0, y: 2.0, z: 3.0 };
        assert_eq!(v.to_string(), "1 2 3");
    }

    #[test]
    fn matrix4_display_joins_rows_with_two_spaces() {
        assert_eq!(Matrix4::IDENTITY.to_string(), "1 0 0 0  0 1 0 0  0 0 1 0  0 0 0 1");
    }

    #[test]
    fn quaternion_normalises_in_place() {
        let q = Quaternion { x: 1.0, y: 2.0, z: 3.0, w: 4.0 }.normalised();
        let len: f32 = (q.x * q.x + q.y * q.y + q.z * q.z + q.w * q.w).sqrt();
        assert!((len - 1.0).abs() < 1e-5);
    }

    #[test]
    fn color_roundtrips_through_display_and_parse() {
        let c = Color::new(10, 20, 30, 255);
        let parsed: Color = c.to_string().parse().unwrap();
        assert_eq!(c, parsed);
    }
}
