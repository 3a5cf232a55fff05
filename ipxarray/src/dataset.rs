use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::try_join_all;

use crate::{
    array::DataArray,
    coordinate::Coordinate,
    errors::{Error, Result},
    metadata::{Attributes, DataType},
    selection::{IndexSelection, ResolvedSelection, Selection},
    stream::{Materialize, SelectionStream, StreamOptions},
};

/// Named arrays sharing one set of dimensions and coordinates.
///
/// Every variable that has a dimension agrees on its size. Adding a variable or coordinate that
/// disagrees fails and leaves the dataset as it was.
///
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    dims: BTreeMap<String, usize>,
    coords: BTreeMap<String, Coordinate>,
    variables: BTreeMap<String, DataArray>,
    attrs: Attributes,
    encrypted: bool,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    /// Size of every dimension
    ///
    pub fn dims(&self) -> &BTreeMap<String, usize> {
        &self.dims
    }

    pub fn coords(&self) -> &BTreeMap<String, Coordinate> {
        &self.coords
    }

    pub fn coord(&self, dim: &str) -> Option<&Coordinate> {
        self.coords.get(dim)
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn variable(&self, name: &str) -> Option<&DataArray> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&String, &DataArray)> {
        self.variables.iter()
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Whether any variable's codec chain includes an encryption codec. Informational.
    ///
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub(crate) fn set_encrypted(&mut self, encrypted: bool) {
        self.encrypted = encrypted;
    }

    /// Add a coordinate for the dimension of the same name.
    ///
    pub fn add_coordinate(&mut self, coord: Coordinate) -> Result<()> {
        let dim = coord.name().to_string();
        self.check_size(&dim, coord.len(), &dim)?;
        self.check_coord(&coord)?;

        self.dims.insert(dim.clone(), coord.len());
        for variable in self.variables.values_mut() {
            if variable.axis_of(&dim).is_some() && variable.coord(&dim).is_none() {
                *variable = variable.clone().with_coord(coord.clone())?;
            }
        }
        self.coords.insert(dim, coord);

        Ok(())
    }

    /// Add or replace a variable.
    ///
    /// Coordinates the array carries are added to the dataset. The stored variable carries the
    /// dataset's coordinates for each of its dimensions.
    ///
    pub fn add_variable<S: Into<String>>(&mut self, name: S, array: DataArray) -> Result<()> {
        let name = name.into();
        let mut own: BTreeMap<&str, usize> = BTreeMap::new();
        for (dim, &size) in array.dims().iter().zip(array.shape()) {
            self.check_size(dim, size, &name)?;
            match own.insert(dim.as_str(), size) {
                Some(existing) if existing != size => {
                    return Err(Error::DimensionSizeConflict {
                        dim: dim.clone(),
                        variable: name,
                        existing,
                        requested: size,
                    })
                }
                _ => {}
            }
        }
        for coord in array.coords().values() {
            self.check_coord(coord)?;
        }

        let mut coords = array.coords().clone();
        for (dim, &size) in array.dims().iter().zip(array.shape()) {
            self.dims.insert(dim.clone(), size);
            match coords.get(dim) {
                Some(coord) => {
                    self.coords
                        .entry(dim.clone())
                        .or_insert_with(|| coord.clone());
                }
                None => {
                    if let Some(coord) = self.coords.get(dim) {
                        coords.insert(dim.clone(), coord.clone());
                    }
                }
            }
        }

        let array = array.with_name(name.clone()).with_coords(coords);
        self.variables.insert(name, array);

        Ok(())
    }

    fn check_size(&self, dim: &str, requested: usize, variable: &str) -> Result<()> {
        match self.dims.get(dim) {
            Some(&existing) if existing != requested => Err(Error::DimensionSizeConflict {
                dim: dim.to_string(),
                variable: variable.to_string(),
                existing,
                requested,
            }),
            _ => Ok(()),
        }
    }

    fn check_coord(&self, coord: &Coordinate) -> Result<()> {
        match self.coords.get(coord.name()) {
            Some(existing) if !existing.same_labels(coord) => {
                Err(Error::CoordinateMismatch(coord.name().to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Select by coordinate label across every variable
    ///
    pub async fn sel(&self, selection: &Selection) -> Result<Dataset> {
        let resolved = selection.resolve(&self.dims, &self.coords)?;

        self.materialize(&resolved).await
    }

    /// Select by position across every variable
    ///
    pub async fn isel(&self, selection: &IndexSelection) -> Result<Dataset> {
        let resolved = selection.resolve(&self.dims)?;

        self.materialize(&resolved).await
    }

    /// Select by coordinate label, delivering the result in pieces of about
    /// `options.chunk_bytes` each. Every piece holds every variable.
    ///
    pub fn sel_stream(
        &self,
        selection: &Selection,
        options: StreamOptions,
    ) -> Result<SelectionStream<Dataset>> {
        let resolved = selection.resolve(&self.dims, &self.coords)?;

        SelectionStream::new(self.clone(), resolved, options)
    }

    /// Bytes the selection would take in memory, summed over variables. No I/O.
    ///
    pub fn size_estimation(&self, selection: Option<&Selection>) -> Result<u64> {
        let resolved = match selection {
            Some(selection) => selection.resolve(&self.dims, &self.coords)?,
            None => ResolvedSelection::new(),
        };

        Ok(self.estimate(&resolved))
    }

    fn estimate(&self, resolved: &ResolvedSelection) -> u64 {
        self.variables
            .values()
            .map(|variable| variable.estimate(resolved))
            .sum()
    }

    async fn materialize(&self, resolved: &ResolvedSelection) -> Result<Dataset> {
        let variables = try_join_all(self.variables.iter().map(|(name, variable)| async move {
            Ok::<_, Error>((name.clone(), variable.materialize(resolved).await?))
        }))
        .await?
        .into_iter()
        .collect();

        let mut dims = BTreeMap::new();
        for (dim, &size) in &self.dims {
            match resolved.get(dim) {
                None => {
                    dims.insert(dim.clone(), size);
                }
                Some(selection) if !selection.is_scalar() => {
                    dims.insert(dim.clone(), selection.extent());
                }
                Some(_) => {}
            }
        }

        let coords = self
            .coords
            .iter()
            .filter_map(|(dim, coord)| {
                let coord = match resolved.get(dim) {
                    None => Some(coord.clone()),
                    Some(selection) => coord.select(selection),
                };
                coord.map(|coord| (dim.clone(), coord))
            })
            .collect();

        Ok(Dataset {
            dims,
            coords,
            variables,
            attrs: self.attrs.clone(),
            encrypted: self.encrypted,
        })
    }
}

#[async_trait]
impl Materialize for Dataset {
    type Output = Dataset;

    async fn materialize_selection(&self, resolved: &ResolvedSelection) -> Result<Dataset> {
        self.materialize(resolved).await
    }

    fn estimate_selection(&self, resolved: &ResolvedSelection) -> u64 {
        self.estimate(resolved)
    }

    /// The variable taking the most bytes under the selection, among those along `along`
    fn reference(
        &self,
        resolved: &ResolvedSelection,
        along: Option<&str>,
    ) -> Option<(Vec<String>, Vec<usize>, DataType)> {
        self.variables
            .values()
            .filter(|variable| along.map_or(true, |dim| variable.axis_of(dim).is_some()))
            .max_by_key(|variable| variable.estimate(resolved))
            .map(|variable| {
                (
                    variable.dims().to_vec(),
                    variable.shape().to_vec(),
                    variable.dtype(),
                )
            })
    }
}
