//! Sorting the arrays of a group into coordinates and data variables.
//!
use std::collections::BTreeSet;

/// Name and dimension names of one array, all the classifier looks at
///
#[derive(Clone, Debug)]
pub struct ArrayOutline {
    pub name: String,
    pub dims: Vec<String>,
}

impl ArrayOutline {
    pub fn new<S: Into<String>>(name: S, dims: &[&str]) -> Self {
        Self {
            name: name.into(),
            dims: dims.iter().map(|dim| dim.to_string()).collect(),
        }
    }

    fn is_dimension_coordinate(&self) -> bool {
        self.dims.len() == 1 && self.dims[0] == self.name
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    /// Arrays to load eagerly as coordinates
    pub coordinates: Vec<String>,

    /// Arrays to expose as data variables
    pub variables: Vec<String>,

    /// Whether the coordinates were also made into variables, there being no data
    pub promoted: bool,
}

/// Decide which arrays are coordinates and which are data.
///
/// An array of rank two or more is data-like, as is a one dimensional array whose name isn't
/// the name of any dimension. A one dimensional array is a coordinate when its name is a
/// dimension of some data-like array, or when its only dimension is named after it. Everything
/// that isn't a coordinate is a data variable. Without any data-like arrays, the coordinates
/// double as data variables.
///
pub fn classify(arrays: &[ArrayOutline]) -> Classification {
    let all_dims: BTreeSet<&str> = arrays
        .iter()
        .flat_map(|array| array.dims.iter().map(String::as_str))
        .collect();

    let is_data_like = |array: &ArrayOutline| match array.dims.len() {
        0 => false,
        1 => !all_dims.contains(array.name.as_str()),
        _ => true,
    };

    let data_like: Vec<&ArrayOutline> = arrays.iter().filter(|&array| is_data_like(array)).collect();
    let referenced: BTreeSet<&str> = data_like
        .iter()
        .flat_map(|array| array.dims.iter().map(String::as_str))
        .collect();

    let is_coordinate = |array: &ArrayOutline| {
        if array.dims.len() != 1 {
            return false;
        }
        if data_like.is_empty() {
            array.is_dimension_coordinate()
        } else {
            !is_data_like(array)
                && (referenced.contains(array.name.as_str()) || array.is_dimension_coordinate())
        }
    };

    let mut classification = Classification::default();
    for array in arrays {
        if is_coordinate(array) {
            classification.coordinates.push(array.name.clone());
        } else {
            classification.variables.push(array.name.clone());
        }
    }

    if data_like.is_empty() {
        classification.promoted = true;
        classification
            .variables
            .extend(classification.coordinates.iter().cloned());
    }

    classification
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_gridded_dataset() {
        let arrays = [
            ArrayOutline::new("time", &["time"]),
            ArrayOutline::new("lat", &["lat"]),
            ArrayOutline::new("lon", &["lon"]),
            ArrayOutline::new("precip", &["time", "lat", "lon"]),
            ArrayOutline::new("station_count", &["time"]),
            ArrayOutline::new("crs", &[]),
        ];
        let classification = classify(&arrays);

        assert_eq!(classification.coordinates, names(&["time", "lat", "lon"]));
        assert_eq!(
            classification.variables,
            names(&["precip", "station_count", "crs"])
        );
        assert!(!classification.promoted);
    }

    #[test]
    fn test_unreferenced_one_dimensional_array() {
        // No data uses `offset`, it is still the coordinate of its own dimension. `other` lies
        // along `x` without being named after a dimension, so it is data.
        let arrays = [
            ArrayOutline::new("x", &["x"]),
            ArrayOutline::new("offset", &["offset"]),
            ArrayOutline::new("other", &["x"]),
            ArrayOutline::new("field", &["x", "x"]),
        ];
        let classification = classify(&arrays);

        assert_eq!(classification.coordinates, names(&["x", "offset"]));
        assert_eq!(classification.variables, names(&["other", "field"]));
    }

    #[test]
    fn test_pure_coordinate_dataset() {
        let arrays = [
            ArrayOutline::new("time", &["time"]),
            ArrayOutline::new("lat", &["lat"]),
        ];
        let classification = classify(&arrays);

        assert_eq!(classification.coordinates, names(&["time", "lat"]));
        assert_eq!(classification.variables, names(&["time", "lat"]));
        assert!(classification.promoted);
    }

    #[test]
    fn test_nothing() {
        let classification = classify(&[]);
        assert!(classification.coordinates.is_empty());
        assert!(classification.variables.is_empty());
    }
}
