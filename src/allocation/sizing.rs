use crate::model::SizeClass;

const LARGE_PREFIXES: &[&str] = &["A33", "A34", "A35", "A38", "B74", "B77", "B78"];
const SMALL_PREFIXES: &[&str] = &["AT4", "AT7", "ATR", "DH8", "DHC", "CRJ", "E17", "E19", "E75", "C208"];

/// Size class from an ICAO type designator. Unknown or missing types are medium.
pub fn size_for_aircraft(aircraft_type: Option<&str>) -> SizeClass {
    let Some(code) = aircraft_type.map(|t| t.trim().to_ascii_uppercase()) else {
        return SizeClass::Medium;
    };
    if LARGE_PREFIXES.iter().any(|p| code.starts_with(p)) {
        SizeClass::Large
    } else if SMALL_PREFIXES.iter().any(|p| code.starts_with(p)) {
        SizeClass::Small
    } else {
        SizeClass::Medium
    }
}
