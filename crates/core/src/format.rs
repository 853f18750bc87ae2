//! Export formats and the external converters some of them require.
//!
//! Rasters and SVG come straight out of the rendering surface. `eps`
//! and `emf` are produced downstream by external tools (`pdftops` from
//! poppler, `inkscape`), so a job asking for them is only accepted when
//! the tool was found on `PATH` at startup.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Every output format a job may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Png,
    Jpeg,
    Webp,
    Svg,
    Pdf,
    Eps,
    Emf,
    Json,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 8] = [
        ExportFormat::Png,
        ExportFormat::Jpeg,
        ExportFormat::Webp,
        ExportFormat::Svg,
        ExportFormat::Pdf,
        ExportFormat::Eps,
        ExportFormat::Emf,
        ExportFormat::Json,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpeg",
            ExportFormat::Webp => "webp",
            ExportFormat::Svg => "svg",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Eps => "eps",
            ExportFormat::Emf => "emf",
            ExportFormat::Json => "json",
        }
    }

    /// External tool needed downstream of the renderer, if any.
    pub fn required_converter(self) -> Option<Converter> {
        match self {
            ExportFormat::Eps => Some(Converter::Pdftops),
            ExportFormat::Emf => Some(Converter::Inkscape),
            _ => None,
        }
    }

    /// Whether the renderer output must be captured through the page's
    /// print-to-PDF path rather than taken from the script result.
    pub fn needs_pdf_capture(self) -> bool {
        matches!(self, ExportFormat::Pdf | ExportFormat::Eps)
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let name = if lower == "jpg" { "jpeg" } else { lower.as_str() };
        ExportFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == name)
            .ok_or_else(|| {
                let known: Vec<&str> = ExportFormat::ALL.iter().map(|f| f.as_str()).collect();
                CoreError::Validation(format!(
                    "Unsupported format \"{s}\"; expected one of {}",
                    known.join(", ")
                ))
            })
    }
}

/// An external conversion tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    Pdftops,
    Inkscape,
}

impl Converter {
    pub fn executable(self) -> &'static str {
        match self {
            Converter::Pdftops => "pdftops",
            Converter::Inkscape => "inkscape",
        }
    }

    /// Message shown to the caller when the tool is missing.
    pub fn missing_message(self) -> &'static str {
        match self {
            Converter::Pdftops => {
                "Exporting to EPS format requires the pdftops command \
                 which is provided by the poppler library. \
                 Please install poppler and make sure the pdftops command \
                 is available on the PATH"
            }
            Converter::Inkscape => {
                "Exporting to EMF format requires inkscape. \
                 Please install inkscape and make sure it is available on the PATH"
            }
        }
    }
}

/// Which converters were found when the process started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConverterAvailability {
    pub pdftops: bool,
    pub inkscape: bool,
}

impl ConverterAvailability {
    /// Probe `PATH` for every converter.
    pub fn detect() -> Self {
        Self {
            pdftops: which::which(Converter::Pdftops.executable()).is_ok(),
            inkscape: which::which(Converter::Inkscape.executable()).is_ok(),
        }
    }

    /// Treat every converter as installed.
    pub fn all() -> Self {
        Self {
            pdftops: true,
            inkscape: true,
        }
    }

    pub fn has(&self, converter: Converter) -> bool {
        match converter {
            Converter::Pdftops => self.pdftops,
            Converter::Inkscape => self.inkscape,
        }
    }

    /// Return the converter `format` needs but which is not installed.
    pub fn missing_for(&self, format: ExportFormat) -> Option<Converter> {
        format.required_converter().filter(|c| !self.has(*c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats_case_insensitively() {
        assert_eq!("PNG".parse::<ExportFormat>().unwrap(), ExportFormat::Png);
        assert_eq!("svg".parse::<ExportFormat>().unwrap(), ExportFormat::Svg);
        assert_eq!("jpg".parse::<ExportFormat>().unwrap(), ExportFormat::Jpeg);
    }

    #[test]
    fn rejects_unknown_format() {
        let err = "bmp".parse::<ExportFormat>().unwrap_err();
        assert!(err.to_string().contains("bmp"));
    }

    #[test]
    fn only_eps_and_emf_need_converters() {
        for format in ExportFormat::ALL {
            let expected = matches!(format, ExportFormat::Eps | ExportFormat::Emf);
            assert_eq!(format.required_converter().is_some(), expected, "{format}");
        }
    }

    #[test]
    fn missing_converter_reported_per_format() {
        let avail = ConverterAvailability {
            pdftops: false,
            inkscape: true,
        };
        assert_eq!(avail.missing_for(ExportFormat::Eps), Some(Converter::Pdftops));
        assert_eq!(avail.missing_for(ExportFormat::Emf), None);
        assert_eq!(avail.missing_for(ExportFormat::Png), None);
    }

    #[test]
    fn pdf_capture_for_pdf_and_eps() {
        assert!(ExportFormat::Pdf.needs_pdf_capture());
        assert!(ExportFormat::Eps.needs_pdf_capture());
        assert!(!ExportFormat::Svg.needs_pdf_capture());
    }
}
