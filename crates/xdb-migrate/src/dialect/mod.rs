//! Canonical type system shared by every dialect.
//!
//! Each driver provides a [`ToCanonical`] / [`FromCanonical`] pair for its
//! native types; [`ComposedMapper`] chains a source and a target pair. The
//! inspector uses [`CanonicalType::relation_to`] to classify column changes.

mod canonical;

pub use canonical::{
    clamp_decimal, decimal_from_catalog, string_from_catalog, CanonicalType, CanonicalTypeInfo,
    ColumnMapping, ComposedMapper, FromCanonical, ToCanonical, TypeMapping, TypeRelation,
};
