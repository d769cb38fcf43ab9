/// Warehouse rows carry timestamps as (possibly stringified) floating
/// point seconds, e.g. `"1.634567E9"`.
pub mod float_timestamp {
    use serde::*;
    use time::OffsetDateTime;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(t: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(t.unix_timestamp())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
        let seconds = match Repr::deserialize(d)? {
            Repr::Number(n) => n,
            Repr::Text(s) => s.trim().parse::<f64>().map_err(de::Error::custom)?,
        };
        OffsetDateTime::from_unix_timestamp(seconds.trunc() as i64).map_err(de::Error::custom)
    }
}
