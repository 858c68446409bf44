use anyhow::{anyhow, Context, Result};

use super::GpsReading;

const FIELD_COUNT: usize = 9;

/// Parses a `+CGPSINFO:` response line.
///
/// `+CGPSINFO: 1337.3080,N,12311.6700,E,181024,062153.0,35.2,0.0,` yields a reading at
/// 13.6218, 123.1945. A line whose fields are all empty means the receiver has no fix.
pub fn parse_cgpsinfo(line: &str, nominal_accuracy_m: f64) -> Result<Option<GpsReading>> {
    let body = line
        .trim()
        .strip_prefix("+CGPSINFO:")
        .ok_or_else(|| anyhow!("not a +CGPSINFO response: {}", line.trim()))?;
    let fields: Vec<&str> = body.split(',').map(str::trim).collect();
    if fields.iter().all(|f| f.is_empty()) {
        return Ok(None);
    }
    if fields.len() < 4 {
        return Err(anyhow!(
            "+CGPSINFO has {} fields, expected {}",
            fields.len(),
            FIELD_COUNT
        ));
    }
    if fields[..4].iter().any(|f| f.is_empty()) {
        return Ok(None);
    }

    let latitude = parse_coordinate(fields[0], fields[1]).context("latitude")?;
    let longitude = parse_coordinate(fields[2], fields[3]).context("longitude")?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(anyhow!(
            "coordinates out of range: {}, {}",
            latitude,
            longitude
        ));
    }

    Ok(Some(GpsReading {
        latitude,
        longitude,
        accuracy_m: nominal_accuracy_m,
        quality: 1,
    }))
}

/// Converts `DDMM.MMMM` / `DDDMM.MMMM` plus a hemisphere letter to signed decimal degrees.
pub fn parse_coordinate(value: &str, hemisphere: &str) -> Result<f64> {
    let raw: f64 = value
        .parse()
        .map_err(|_| anyhow!("invalid coordinate '{}'", value))?;
    if !raw.is_finite() || raw < 0.0 {
        return Err(anyhow!("invalid coordinate '{}'", value));
    }
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    if minutes >= 60.0 {
        return Err(anyhow!("coordinate minutes out of range in '{}'", value));
    }
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Ok(decimal),
        "S" | "W" => Ok(-decimal),
        other => Err(anyhow!("invalid hemisphere '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn parses_a_fix() -> Result<()> {
        let reading = parse_cgpsinfo(
            "+CGPSINFO: 1337.3080,N,12311.6700,E,181024,062153.0,35.2,0.0,",
            10.0,
        )?
        .expect("fix");
        assert!(close(reading.latitude, 13.6218));
        assert!(close(reading.longitude, 123.1945));
        assert_eq!(reading.accuracy_m, 10.0);
        Ok(())
    }

    #[test]
    fn southern_and_western_hemispheres_are_negative() -> Result<()> {
        let reading = parse_cgpsinfo("+CGPSINFO: 3352.1280,S,15112.5580,W,,,,,", 5.0)?
            .expect("fix");
        assert!(close(reading.latitude, -33.8688));
        assert!(close(reading.longitude, -151.2093));
        Ok(())
    }

    #[test]
    fn empty_fields_mean_no_fix() -> Result<()> {
        assert_eq!(parse_cgpsinfo("+CGPSINFO: ,,,,,,,,", 10.0)?, None);
        assert_eq!(parse_cgpsinfo("+CGPSINFO:", 10.0)?, None);
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_cgpsinfo("+CGPSINFO: 1337.3080,Q,12311.6700,E", 10.0).is_err());
        assert!(parse_cgpsinfo("+CGPSINFO: 1377.0,N,12311.6700,E", 10.0).is_err());
        assert!(parse_cgpsinfo("OK", 10.0).is_err());
    }
}
