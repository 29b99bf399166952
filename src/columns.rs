//! Result-set column name normalization

/// Anything that describes a result-set column by name
pub trait ColumnDescriptor {
    /// Column name as reported by the driver
    fn column_name(&self) -> &str;
}

impl ColumnDescriptor for str {
    fn column_name(&self) -> &str {
        self
    }
}

impl ColumnDescriptor for String {
    fn column_name(&self) -> &str {
        self
    }
}

impl<T: ColumnDescriptor + ?Sized> ColumnDescriptor for &T {
    fn column_name(&self) -> &str {
        (**self).column_name()
    }
}

/// Single-element tuples, the shape of DB-API style descriptors
impl<T: ColumnDescriptor> ColumnDescriptor for (T,) {
    fn column_name(&self) -> &str {
        self.0.column_name()
    }
}

/// Column names in descriptor order, lowercased when `lowercase` is set
///
/// `None` (a statement without a result set) and an empty slice both yield an
/// empty list.
///
/// # Examples
///
/// ```
/// use fraiseql_conn::columns::normalize_columns;
///
/// let descriptors = [("ID",), ("Name",)];
/// assert_eq!(normalize_columns(Some(&descriptors[..]), false), ["ID", "Name"]);
/// assert_eq!(normalize_columns(Some(&descriptors[..]), true), ["id", "name"]);
/// assert!(normalize_columns::<(&str,)>(None, true).is_empty());
/// ```
pub fn normalize_columns<D: ColumnDescriptor>(
    descriptors: Option<&[D]>,
    lowercase: bool,
) -> Vec<String> {
    descriptors
        .unwrap_or_default()
        .iter()
        .map(|descriptor| {
            let name = descriptor.column_name();
            if lowercase {
                name.to_lowercase()
            } else {
                name.to_string()
            }
        })
        .collect()
}
