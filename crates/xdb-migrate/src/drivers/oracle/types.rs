//! Oracle native ⇄ canonical type tables.
//!
//! Catalog values come from `ALL_TAB_COLUMNS`: `max_length` is `CHAR_LENGTH`,
//! `precision`/`scale` are `DATA_PRECISION`/`DATA_SCALE` with NULL scale
//! reported as -127 so unconstrained NUMBER can be told apart from NUMBER(*,0).

use crate::dialect::{
    clamp_decimal, CanonicalType, CanonicalTypeInfo, FromCanonical, ToCanonical, TypeMapping,
};

use super::OracleDialect;

const MAX_DECIMAL_PRECISION: u8 = 38;
const MAX_CHAR: u32 = 2000;
const MAX_VARCHAR2: u32 = 4000;

impl ToCanonical for OracleDialect {
    fn to_canonical(
        &self,
        data_type: &str,
        max_length: i32,
        precision: i32,
        scale: i32,
    ) -> CanonicalTypeInfo {
        let upper = data_type.to_uppercase();
        // TIMESTAMP(6) WITH TIME ZONE -> TIMESTAMP WITH TIME ZONE
        let base = match (upper.find('('), upper.find(')')) {
            (Some(open), Some(close)) if close > open => {
                format!("{}{}", &upper[..open], &upper[close + 1..])
            }
            _ => upper.clone(),
        };

        match base.as_str() {
            "NUMBER" | "INTEGER" | "INT" | "SMALLINT" => number_to_canonical(precision, scale),
            "FLOAT" | "BINARY_FLOAT" | "BINARY_DOUBLE" => {
                CanonicalTypeInfo::lossless(CanonicalType::Float)
            }
            "CHAR" | "NCHAR" => {
                CanonicalTypeInfo::lossless(CanonicalType::FixedString(max_length.max(1) as u32))
            }
            "VARCHAR2" | "NVARCHAR2" | "VARCHAR" => {
                CanonicalTypeInfo::lossless(CanonicalType::VariableString(max_length.max(1) as u32))
            }
            "CLOB" | "NCLOB" | "LONG" => CanonicalTypeInfo::lossless(CanonicalType::Text),
            "BLOB" => CanonicalTypeInfo::lossless(CanonicalType::Binary),
            "DATE" => CanonicalTypeInfo::lossless(CanonicalType::Timestamp),
            "TIMESTAMP" => CanonicalTypeInfo::lossless(CanonicalType::Timestamp),
            "TIMESTAMP WITH TIME ZONE" | "TIMESTAMP WITH LOCAL TIME ZONE" => {
                CanonicalTypeInfo::lossless(CanonicalType::TimestampTz)
            }
            _ => CanonicalTypeInfo::unsupported(data_type),
        }
    }
}

fn number_to_canonical(precision: i32, scale: i32) -> CanonicalTypeInfo {
    if precision <= 0 && scale < 0 {
        return CanonicalTypeInfo::lossy(
            CanonicalType::Decimal {
                precision: 38,
                scale: 10,
            },
            "unconstrained NUMBER bounded to DECIMAL(38,10)",
        );
    }
    let scale = scale.max(0);
    if scale == 0 {
        match precision {
            1 => return CanonicalTypeInfo::lossless(CanonicalType::Boolean),
            2..=10 => return CanonicalTypeInfo::lossless(CanonicalType::Integer),
            11..=19 => return CanonicalTypeInfo::lossless(CanonicalType::BigInteger),
            _ => {}
        }
    }
    let precision: u8 = if precision <= 0 {
        38
    } else {
        precision.min(38) as u8
    };
    CanonicalTypeInfo::lossless(CanonicalType::Decimal {
        precision,
        scale: scale.min(precision as i32) as u8,
    })
}

impl FromCanonical for OracleDialect {
    fn from_canonical(&self, canonical: &CanonicalType) -> TypeMapping {
        match canonical {
            CanonicalType::Integer => TypeMapping::lossless("NUMBER(10)"),
            CanonicalType::BigInteger => TypeMapping::lossless("NUMBER(19)"),
            CanonicalType::Decimal { precision, scale } => {
                let (p, s, warning) = clamp_decimal(*precision, *scale, MAX_DECIMAL_PRECISION);
                let target = format!("NUMBER({},{})", p, s);
                match warning {
                    Some(w) => TypeMapping::lossy(target, w),
                    None => TypeMapping::lossless(target),
                }
            }
            CanonicalType::Float => TypeMapping::lossless("BINARY_DOUBLE"),
            CanonicalType::Boolean => TypeMapping::lossless("NUMBER(1)"),
            CanonicalType::FixedString(n) if *n <= MAX_CHAR => {
                TypeMapping::lossless(format!("CHAR({} CHAR)", n))
            }
            CanonicalType::FixedString(n) | CanonicalType::VariableString(n)
                if *n <= MAX_VARCHAR2 =>
            {
                TypeMapping::lossless(format!("VARCHAR2({} CHAR)", n))
            }
            CanonicalType::FixedString(_) | CanonicalType::VariableString(_) | CanonicalType::Text => {
                TypeMapping::lossless("CLOB")
            }
            CanonicalType::Binary => TypeMapping::lossless("BLOB"),
            CanonicalType::Date => TypeMapping::lossless("DATE"),
            CanonicalType::Time => {
                TypeMapping::lossy("VARCHAR2(18 CHAR)", "TIME stored as text")
            }
            CanonicalType::Timestamp => TypeMapping::lossless("TIMESTAMP(6)"),
            CanonicalType::TimestampTz => TypeMapping::lossless("TIMESTAMP(6) WITH TIME ZONE"),
            CanonicalType::Unknown(native) => {
                TypeMapping::lossy("CLOB", format!("'{}' stored as text", native))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(data_type: &str, len: i32, p: i32, s: i32) -> CanonicalType {
        OracleDialect::new()
            .to_canonical(data_type, len, p, s)
            .canonical_type
    }

    #[test]
    fn test_number_mapping() {
        assert_eq!(canon("NUMBER", 0, 1, 0), CanonicalType::Boolean);
        assert_eq!(canon("NUMBER", 0, 10, 0), CanonicalType::Integer);
        assert_eq!(canon("NUMBER", 0, 19, 0), CanonicalType::BigInteger);
        assert_eq!(
            canon("NUMBER", 0, 10, 2),
            CanonicalType::Decimal {
                precision: 10,
                scale: 2
            }
        );
        assert_eq!(
            canon("NUMBER", 0, 0, 0),
            CanonicalType::Decimal {
                precision: 38,
                scale: 0
            }
        );
        assert!(OracleDialect::new().to_canonical("NUMBER", 0, 0, -1).is_lossy);
    }

    #[test]
    fn test_strings_and_temporal() {
        assert_eq!(canon("VARCHAR2", 50, 0, 0), CanonicalType::VariableString(50));
        assert_eq!(canon("CLOB", 0, 0, 0), CanonicalType::Text);
        assert_eq!(canon("DATE", 0, 0, 0), CanonicalType::Timestamp);
        assert_eq!(
            canon("TIMESTAMP(6) WITH TIME ZONE", 0, 0, 6),
            CanonicalType::TimestampTz
        );
    }

    #[test]
    fn test_raw_is_unsupported() {
        assert!(canon("RAW", 16, 0, 0).is_unknown());
        assert!(canon("SDO_GEOMETRY", 0, 0, 0).is_unknown());
    }

    #[test]
    fn test_from_canonical() {
        let d = OracleDialect::new();
        assert_eq!(d.from_canonical(&CanonicalType::Integer).target_type, "NUMBER(10)");
        assert_eq!(
            d.from_canonical(&CanonicalType::VariableString(20)).target_type,
            "VARCHAR2(20 CHAR)"
        );
        assert_eq!(
            d.from_canonical(&CanonicalType::VariableString(5000)).target_type,
            "CLOB"
        );
        assert!(d.from_canonical(&CanonicalType::Time).is_lossy);
    }
}
