//! MySQL/MariaDB native ⇄ canonical type tables.

use crate::dialect::{
    clamp_decimal, decimal_from_catalog, string_from_catalog, CanonicalType, CanonicalTypeInfo,
    FromCanonical, ToCanonical, TypeMapping,
};

use super::MysqlDialect;

/// DECIMAL precision ceiling.
const MAX_DECIMAL_PRECISION: u8 = 65;

/// DECIMAL scale ceiling.
const MAX_DECIMAL_SCALE: u8 = 30;

/// Longest VARCHAR that fits a utf8mb4 row (65535 bytes / 4).
const MAX_VARCHAR_CHARS: u32 = 16383;

impl ToCanonical for MysqlDialect {
    fn to_canonical(
        &self,
        data_type: &str,
        max_length: i32,
        precision: i32,
        scale: i32,
    ) -> CanonicalTypeInfo {
        let lower = data_type.to_lowercase();
        let unsigned = lower.contains("unsigned");
        let base = lower
            .trim_end_matches(" zerofill")
            .trim_end_matches(" unsigned")
            .trim();

        match base {
            "tinyint(1)" | "bool" | "boolean" => CanonicalTypeInfo::lossless(CanonicalType::Boolean),
            "bit" if precision <= 1 => CanonicalTypeInfo::lossless(CanonicalType::Boolean),
            "bit" => CanonicalTypeInfo::lossy(
                CanonicalType::BigInteger,
                format!("BIT({}) stored as integer", precision),
            ),
            "tinyint" | "smallint" | "mediumint" => {
                CanonicalTypeInfo::lossless(CanonicalType::Integer)
            }
            "int" | "integer" if unsigned => CanonicalTypeInfo::lossless(CanonicalType::BigInteger),
            "int" | "integer" => CanonicalTypeInfo::lossless(CanonicalType::Integer),
            "bigint" if unsigned => CanonicalTypeInfo::lossless(CanonicalType::Decimal {
                precision: 20,
                scale: 0,
            }),
            "bigint" => CanonicalTypeInfo::lossless(CanonicalType::BigInteger),
            "decimal" | "numeric" | "dec" | "fixed" => {
                decimal_from_catalog(precision, scale)
            }
            "float" | "double" | "real" | "double precision" => {
                CanonicalTypeInfo::lossless(CanonicalType::Float)
            }
            "char" => CanonicalTypeInfo::lossless(string_from_catalog(true, max_length, 255)),
            "varchar" => CanonicalTypeInfo::lossless(string_from_catalog(
                false,
                max_length,
                MAX_VARCHAR_CHARS,
            )),
            "tinytext" | "text" | "mediumtext" | "longtext" => {
                CanonicalTypeInfo::lossless(CanonicalType::Text)
            }
            "enum" | "set" => CanonicalTypeInfo::lossy(
                string_from_catalog(false, max_length.max(1), MAX_VARCHAR_CHARS),
                format!("{} value list dropped", base.to_uppercase()),
            ),
            "json" => CanonicalTypeInfo::lossy(CanonicalType::Text, "JSON stored as text"),
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                CanonicalTypeInfo::lossless(CanonicalType::Binary)
            }
            "date" => CanonicalTypeInfo::lossless(CanonicalType::Date),
            "time" => CanonicalTypeInfo::lossless(CanonicalType::Time),
            "datetime" | "timestamp" => CanonicalTypeInfo::lossless(CanonicalType::Timestamp),
            "year" => CanonicalTypeInfo::lossy(CanonicalType::Integer, "YEAR stored as integer"),
            _ => CanonicalTypeInfo::unsupported(data_type),
        }
    }
}

impl FromCanonical for MysqlDialect {
    fn from_canonical(&self, canonical: &CanonicalType) -> TypeMapping {
        match canonical {
            CanonicalType::Integer => TypeMapping::lossless("INT"),
            CanonicalType::BigInteger => TypeMapping::lossless("BIGINT"),
            CanonicalType::Decimal { precision, scale } => {
                let (p, s, warning) = clamp_decimal(*precision, *scale, MAX_DECIMAL_PRECISION);
                let target = format!("DECIMAL({},{})", p, s.min(MAX_DECIMAL_SCALE));
                match warning {
                    Some(w) => TypeMapping::lossy(target, w),
                    None if s > MAX_DECIMAL_SCALE => TypeMapping::lossy(
                        target,
                        format!("scale {} exceeds maximum {}", s, MAX_DECIMAL_SCALE),
                    ),
                    None => TypeMapping::lossless(target),
                }
            }
            CanonicalType::Float => TypeMapping::lossless("DOUBLE"),
            CanonicalType::Boolean => TypeMapping::lossless("TINYINT(1)"),
            CanonicalType::FixedString(n) if *n <= 255 => TypeMapping::lossless(format!("CHAR({})", n)),
            CanonicalType::FixedString(n) | CanonicalType::VariableString(n)
                if *n <= MAX_VARCHAR_CHARS =>
            {
                TypeMapping::lossless(format!("VARCHAR({})", n))
            }
            CanonicalType::FixedString(_) | CanonicalType::VariableString(_) | CanonicalType::Text => {
                TypeMapping::lossless("LONGTEXT")
            }
            CanonicalType::Binary => TypeMapping::lossless("LONGBLOB"),
            CanonicalType::Date => TypeMapping::lossless("DATE"),
            CanonicalType::Time => TypeMapping::lossless("TIME(6)"),
            CanonicalType::Timestamp => TypeMapping::lossless("DATETIME(6)"),
            CanonicalType::TimestampTz => {
                TypeMapping::lossy("DATETIME(6)", "timezone offset normalized to UTC")
            }
            CanonicalType::Unknown(native) => {
                TypeMapping::lossy("LONGTEXT", format!("'{}' stored as text", native))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(data_type: &str, len: i32, p: i32, s: i32) -> CanonicalType {
        MysqlDialect::new()
            .to_canonical(data_type, len, p, s)
            .canonical_type
    }

    #[test]
    fn test_to_canonical() {
        assert_eq!(canon("tinyint(1)", 0, 3, 0), CanonicalType::Boolean);
        assert_eq!(canon("tinyint", 0, 3, 0), CanonicalType::Integer);
        assert_eq!(canon("int unsigned", 0, 10, 0), CanonicalType::BigInteger);
        assert_eq!(
            canon("decimal", 0, 10, 2),
            CanonicalType::Decimal {
                precision: 10,
                scale: 2
            }
        );
        assert_eq!(canon("varchar", 50, 0, 0), CanonicalType::VariableString(50));
        assert_eq!(canon("longtext", -1, 0, 0), CanonicalType::Text);
        assert_eq!(canon("datetime", 0, 0, 0), CanonicalType::Timestamp);
        assert!(canon("geometry", 0, 0, 0).is_unknown());
    }

    #[test]
    fn test_json_is_lossy() {
        let info = MysqlDialect::new().to_canonical("json", -1, 0, 0);
        assert_eq!(info.canonical_type, CanonicalType::Text);
        assert!(info.is_lossy);
    }

    #[test]
    fn test_from_canonical() {
        let d = MysqlDialect::new();
        assert_eq!(d.from_canonical(&CanonicalType::Boolean).target_type, "TINYINT(1)");
        assert_eq!(
            d.from_canonical(&CanonicalType::VariableString(20)).target_type,
            "VARCHAR(20)"
        );
        assert_eq!(
            d.from_canonical(&CanonicalType::VariableString(100_000)).target_type,
            "LONGTEXT"
        );
        assert!(d.from_canonical(&CanonicalType::TimestampTz).is_lossy);
    }

    #[test]
    fn test_decimal_clamped() {
        let d = MysqlDialect::new();
        let m = d.from_canonical(&CanonicalType::Decimal {
            precision: 38,
            scale: 35,
        });
        assert_eq!(m.target_type, "DECIMAL(38,30)");
        assert!(m.is_lossy);
    }
}
