//
// choice.rs
// dicom2mesh
//
// Injected decision points for the interactive steps: picking one of
// several DICOM series and picking a crop slice range. Console
// implementations prompt on stdin; fixed implementations answer
// deterministically for headless use.
//

use std::io::{self, BufRead, Write};

use crate::routines::RoutineError;
use crate::series::DicomSeries;

/// Picks one of several discovered DICOM series. Only consulted when a
/// directory holds more than one series.
pub trait SeriesSelector {
    fn select(&self, series: &[DicomSeries]) -> Result<usize, RoutineError>;
}

/// Headless default: refuses to guess between multiple series.
#[derive(Debug, Default)]
pub struct NonInteractiveSelector;

impl SeriesSelector for NonInteractiveSelector {
    fn select(&self, series: &[DicomSeries]) -> Result<usize, RoutineError> {
        Err(RoutineError::AmbiguousSeries {
            count: series.len(),
        })
    }
}

/// Always answers with a predetermined series index.
#[derive(Debug)]
pub struct FixedSeriesSelector(pub usize);

impl SeriesSelector for FixedSeriesSelector {
    fn select(&self, series: &[DicomSeries]) -> Result<usize, RoutineError> {
        if self.0 < series.len() {
            Ok(self.0)
        } else {
            Err(RoutineError::SeriesOutOfRange {
                index: self.0,
                count: series.len(),
            })
        }
    }
}

/// Asks on stdin which series to load.
#[derive(Debug, Default)]
pub struct PromptSeriesSelector;

impl SeriesSelector for PromptSeriesSelector {
    fn select(&self, series: &[DicomSeries]) -> Result<usize, RoutineError> {
        print!("Which DICOM series you wish to load? ");
        io::stdout().flush().ok();
        let index = read_number()?
            .ok_or_else(|| RoutineError::Selection("series index".to_string()))?;
        if index >= series.len() {
            return Err(RoutineError::SeriesOutOfRange {
                index,
                count: series.len(),
            });
        }
        Ok(index)
    }
}

/// Proposes an inclusive `(start, end)` slice range given the slice
/// count. `None` means no usable answer was given; the caller skips
/// cropping in that case.
pub trait SliceRangeSelector {
    fn select(&self, num_slices: usize) -> Option<(usize, usize)>;
}

/// Always answers with a predetermined range.
#[derive(Debug)]
pub struct FixedRangeSelector(pub usize, pub usize);

impl SliceRangeSelector for FixedRangeSelector {
    fn select(&self, _num_slices: usize) -> Option<(usize, usize)> {
        Some((self.0, self.1))
    }
}

/// Asks on stdin for the start and end slice.
#[derive(Debug, Default)]
pub struct PromptRangeSelector;

impl SliceRangeSelector for PromptRangeSelector {
    fn select(&self, num_slices: usize) -> Option<(usize, usize)> {
        println!(
            "Input image slice range from 0 - {}",
            num_slices.saturating_sub(1)
        );
        print!("Start slice = ");
        io::stdout().flush().ok();
        let start = read_number().ok().flatten()?;
        print!("End slice = ");
        io::stdout().flush().ok();
        let end = read_number().ok().flatten()?;
        Some((start, end))
    }
}

fn read_number() -> Result<Option<usize>, RoutineError> {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().parse::<usize>().ok())
}
