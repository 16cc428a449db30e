//! PostgreSQL native ⇄ canonical type tables.
//!
//! Native names are `udt_name` values from `information_schema.columns`.

use crate::dialect::{
    decimal_from_catalog, CanonicalType, CanonicalTypeInfo, FromCanonical, ToCanonical,
    TypeMapping,
};

use super::PostgresDialect;

/// varchar(n) upper bound.
const MAX_VARCHAR: u32 = 10_485_760;

impl ToCanonical for PostgresDialect {
    fn to_canonical(
        &self,
        data_type: &str,
        max_length: i32,
        precision: i32,
        scale: i32,
    ) -> CanonicalTypeInfo {
        let lower = data_type.to_lowercase();
        match lower.as_str() {
            "int2" | "smallint" | "int4" | "integer" | "int" | "serial" => {
                CanonicalTypeInfo::lossless(CanonicalType::Integer)
            }
            "int8" | "bigint" | "bigserial" => CanonicalTypeInfo::lossless(CanonicalType::BigInteger),
            "numeric" | "decimal" if precision <= 0 => CanonicalTypeInfo::lossy(
                CanonicalType::Decimal {
                    precision: 38,
                    scale: 10,
                },
                "unconstrained NUMERIC bounded to DECIMAL(38,10)",
            ),
            "numeric" | "decimal" => decimal_from_catalog(precision, scale),
            "money" => CanonicalTypeInfo::lossy(
                CanonicalType::Decimal {
                    precision: 19,
                    scale: 2,
                },
                "MONEY currency formatting dropped",
            ),
            "float4" | "real" | "float8" | "double precision" => {
                CanonicalTypeInfo::lossless(CanonicalType::Float)
            }
            "bool" | "boolean" => CanonicalTypeInfo::lossless(CanonicalType::Boolean),
            "bpchar" | "char" | "character" => CanonicalTypeInfo::lossless(
                CanonicalType::FixedString(max_length.max(1) as u32),
            ),
            "varchar" | "character varying" if max_length <= 0 => {
                CanonicalTypeInfo::lossless(CanonicalType::Text)
            }
            "varchar" | "character varying" => {
                CanonicalTypeInfo::lossless(CanonicalType::VariableString(max_length as u32))
            }
            "name" => CanonicalTypeInfo::lossless(CanonicalType::VariableString(63)),
            "text" => CanonicalTypeInfo::lossless(CanonicalType::Text),
            "citext" => CanonicalTypeInfo::lossy(CanonicalType::Text, "case-insensitive comparison dropped"),
            "json" | "jsonb" | "xml" => CanonicalTypeInfo::lossy(
                CanonicalType::Text,
                format!("{} stored as text", lower.to_uppercase()),
            ),
            "uuid" => CanonicalTypeInfo::lossy(CanonicalType::FixedString(36), "UUID stored as text"),
            "bytea" => CanonicalTypeInfo::lossless(CanonicalType::Binary),
            "date" => CanonicalTypeInfo::lossless(CanonicalType::Date),
            "time" => CanonicalTypeInfo::lossless(CanonicalType::Time),
            "timetz" => CanonicalTypeInfo::lossy(CanonicalType::Time, "TIME offset dropped"),
            "timestamp" => CanonicalTypeInfo::lossless(CanonicalType::Timestamp),
            "timestamptz" => CanonicalTypeInfo::lossless(CanonicalType::TimestampTz),
            _ => CanonicalTypeInfo::unsupported(data_type),
        }
    }
}

impl FromCanonical for PostgresDialect {
    fn from_canonical(&self, canonical: &CanonicalType) -> TypeMapping {
        match canonical {
            CanonicalType::Integer => TypeMapping::lossless("integer"),
            CanonicalType::BigInteger => TypeMapping::lossless("bigint"),
            CanonicalType::Decimal { precision, scale } => {
                TypeMapping::lossless(format!("numeric({},{})", precision, scale))
            }
            CanonicalType::Float => TypeMapping::lossless("double precision"),
            CanonicalType::Boolean => TypeMapping::lossless("boolean"),
            CanonicalType::FixedString(n) if *n <= MAX_VARCHAR => {
                TypeMapping::lossless(format!("char({})", n))
            }
            CanonicalType::VariableString(n) if *n <= MAX_VARCHAR => {
                TypeMapping::lossless(format!("varchar({})", n))
            }
            CanonicalType::FixedString(_) | CanonicalType::VariableString(_) | CanonicalType::Text => {
                TypeMapping::lossless("text")
            }
            CanonicalType::Binary => TypeMapping::lossless("bytea"),
            CanonicalType::Date => TypeMapping::lossless("date"),
            CanonicalType::Time => TypeMapping::lossless("time"),
            CanonicalType::Timestamp => TypeMapping::lossless("timestamp"),
            CanonicalType::TimestampTz => TypeMapping::lossless("timestamptz"),
            CanonicalType::Unknown(native) => {
                TypeMapping::lossy("text", format!("'{}' stored as text", native))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_canonical() {
        let d = PostgresDialect::new();
        assert_eq!(
            d.to_canonical("int4", 0, 32, 0).canonical_type,
            CanonicalType::Integer
        );
        assert_eq!(
            d.to_canonical("varchar", 50, 0, 0).canonical_type,
            CanonicalType::VariableString(50)
        );
        assert_eq!(
            d.to_canonical("varchar", 0, 0, 0).canonical_type,
            CanonicalType::Text
        );
        assert_eq!(
            d.to_canonical("timestamptz", 0, 0, 0).canonical_type,
            CanonicalType::TimestampTz
        );
        assert!(d.to_canonical("geometry", 0, 0, 0).canonical_type.is_unknown());
        assert!(d.to_canonical("_int4", 0, 0, 0).canonical_type.is_unknown());
    }

    #[test]
    fn test_unconstrained_numeric_is_lossy() {
        let info = PostgresDialect::new().to_canonical("numeric", 0, 0, 0);
        assert!(info.is_lossy);
        assert_eq!(
            info.canonical_type,
            CanonicalType::Decimal {
                precision: 38,
                scale: 10
            }
        );
    }

    #[test]
    fn test_from_canonical() {
        let d = PostgresDialect::new();
        assert_eq!(
            d.from_canonical(&CanonicalType::Decimal {
                precision: 10,
                scale: 2
            })
            .target_type,
            "numeric(10,2)"
        );
        assert_eq!(d.from_canonical(&CanonicalType::Binary).target_type, "bytea");
        assert!(d.from_canonical(&CanonicalType::Unknown("hierarchyid".into())).is_lossy);
    }
}
