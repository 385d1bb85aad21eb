//! Country catalog.
//!
//! The fixed, ordered ISO 3166-1 list of countries a measurement sweeps
//! through. Order is alphabetical by English short name, as ISO publishes
//! it, and is the order results appear in the report.

use std::fmt;

use serde::Serialize;

/// A country that can be pinned as a Tor exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Country {
    /// ISO 3166-1 alpha-2 code, upper case.
    pub code: &'static str,
    /// Display name.
    pub name: &'static str,
}

impl Country {
    pub const fn new(code: &'static str, name: &'static str) -> Self {
        Self { code, name }
    }

    /// Exit node specification understood by Tor's `ExitNodes` option.
    pub fn exit_spec(&self) -> String {
        format!("{{{}}}", self.code.to_ascii_lowercase())
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.code)
    }
}

/// Errors selecting countries from the catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown country code: {0}")]
    UnknownCode(String),
    #[error("Country selection is empty")]
    Empty,
}

/// An ordered selection of countries to measure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryCatalog {
    countries: Vec<Country>,
}

impl CountryCatalog {
    /// The complete ISO 3166-1 catalog.
    pub fn all() -> Self {
        Self {
            countries: COUNTRIES.to_vec(),
        }
    }

    /// Build a catalog from an explicit list, keeping the given order.
    ///
    /// Repeated countries keep only their first position.
    pub fn from_countries(countries: impl IntoIterator<Item = Country>) -> Self {
        let mut unique: Vec<Country> = Vec::new();
        for country in countries {
            if !unique.iter().any(|c| c.code == country.code) {
                unique.push(country);
            }
        }
        Self { countries: unique }
    }

    /// Select a subset by alpha-2 code (case-insensitive).
    ///
    /// The result keeps catalog order regardless of the order of `codes`, and
    /// duplicates collapse to a single entry.
    pub fn select<S: AsRef<str>>(codes: &[S]) -> Result<Self, CatalogError> {
        let mut wanted = Vec::with_capacity(codes.len());
        for code in codes {
            let code = code.as_ref().trim();
            if code.is_empty() {
                continue;
            }
            let country = lookup(code).ok_or_else(|| CatalogError::UnknownCode(code.to_string()))?;
            wanted.push(country.code);
        }

        if wanted.is_empty() {
            return Err(CatalogError::Empty);
        }

        let countries = COUNTRIES
            .iter()
            .filter(|c| wanted.contains(&c.code))
            .copied()
            .collect();

        Ok(Self { countries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Country> {
        self.countries.iter()
    }

    pub fn len(&self) -> usize {
        self.countries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }
}

impl Default for CountryCatalog {
    fn default() -> Self {
        Self::all()
    }
}

/// Look up a country by alpha-2 code (case-insensitive).
pub fn lookup(code: &str) -> Option<Country> {
    COUNTRIES
        .iter()
        .find(|c| c.code.eq_ignore_ascii_case(code))
        .copied()
}

const COUNTRIES: &[Country] = &[
    Country::new("AF", "Afghanistan"),
    Country::new("AX", "Åland Islands"),
    Country::new("AL", "Albania"),
    Country::new("DZ", "Algeria"),
    Country::new("AS", "American Samoa"),
    Country::new("AD", "Andorra"),
    Country::new("AO", "Angola"),
    Country::new("AI", "Anguilla"),
    Country::new("AQ", "Antarctica"),
    Country::new("AG", "Antigua and Barbuda"),
    Country::new("AR", "Argentina"),
    Country::new("AM", "Armenia"),
    Country::new("AW", "Aruba"),
    Country::new("AU", "Australia"),
    Country::new("AT", "Austria"),
    Country::new("AZ", "Azerbaijan"),
    Country::new("BS", "Bahamas"),
    Country::new("BH", "Bahrain"),
    Country::new("BD", "Bangladesh"),
    Country::new("BB", "Barbados"),
    Country::new("BY", "Belarus"),
    Country::new("BE", "Belgium"),
    Country::new("BZ", "Belize"),
    Country::new("BJ", "Benin"),
    Country::new("BM", "Bermuda"),
    Country::new("BT", "Bhutan"),
    Country::new("BO", "Bolivia"),
    Country::new("BQ", "Bonaire, Sint Eustatius and Saba"),
    Country::new("BA", "Bosnia and Herzegovina"),
    Country::new("BW", "Botswana"),
    Country::new("BV", "Bouvet Island"),
    Country::new("BR", "Brazil"),
    Country::new("IO", "British Indian Ocean Territory"),
    Country::new("BN", "Brunei Darussalam"),
    Country::new("BG", "Bulgaria"),
    Country::new("BF", "Burkina Faso"),
    Country::new("BI", "Burundi"),
    Country::new("CV", "Cabo Verde"),
    Country::new("KH", "Cambodia"),
    Country::new("CM", "Cameroon"),
    Country::new("CA", "Canada"),
    Country::new("KY", "Cayman Islands"),
    Country::new("CF", "Central African Republic"),
    Country::new("TD", "Chad"),
    Country::new("CL", "Chile"),
    Country::new("CN", "China"),
    Country::new("CX", "Christmas Island"),
    Country::new("CC", "Cocos (Keeling) Islands"),
    Country::new("CO", "Colombia"),
    Country::new("KM", "Comoros"),
    Country::new("CG", "Congo"),
    Country::new("CD", "Congo, Democratic Republic of the"),
    Country::new("CK", "Cook Islands"),
    Country::new("CR", "Costa Rica"),
    Country::new("CI", "Côte d'Ivoire"),
    Country::new("HR", "Croatia"),
    Country::new("CU", "Cuba"),
    Country::new("CW", "Curaçao"),
    Country::new("CY", "Cyprus"),
    Country::new("CZ", "Czechia"),
    Country::new("DK", "Denmark"),
    Country::new("DJ", "Djibouti"),
    Country::new("DM", "Dominica"),
    Country::new("DO", "Dominican Republic"),
    Country::new("EC", "Ecuador"),
    Country::new("EG", "Egypt"),
    Country::new("SV", "El Salvador"),
    Country::new("GQ", "Equatorial Guinea"),
    Country::new("ER", "Eritrea"),
    Country::new("EE", "Estonia"),
    Country::new("SZ", "Eswatini"),
    Country::new("ET", "Ethiopia"),
    Country::new("FK", "Falkland Islands (Malvinas)"),
    Country::new("FO", "Faroe Islands"),
    Country::new("FJ", "Fiji"),
    Country::new("FI", "Finland"),
    Country::new("FR", "France"),
    Country::new("GF", "French Guiana"),
    Country::new("PF", "French Polynesia"),
    Country::new("TF", "French Southern Territories"),
    Country::new("GA", "Gabon"),
    Country::new("GM", "Gambia"),
    Country::new("GE", "Georgia"),
    Country::new("DE", "Germany"),
    Country::new("GH", "Ghana"),
    Country::new("GI", "Gibraltar"),
    Country::new("GR", "Greece"),
    Country::new("GL", "Greenland"),
    Country::new("GD", "Grenada"),
    Country::new("GP", "Guadeloupe"),
    Country::new("GU", "Guam"),
    Country::new("GT", "Guatemala"),
    Country::new("GG", "Guernsey"),
    Country::new("GN", "Guinea"),
    Country::new("GW", "Guinea-Bissau"),
    Country::new("GY", "Guyana"),
    Country::new("HT", "Haiti"),
    Country::new("HM", "Heard Island and McDonald Islands"),
    Country::new("VA", "Holy See"),
    Country::new("HN", "Honduras"),
    Country::new("HK", "Hong Kong"),
    Country::new("HU", "Hungary"),
    Country::new("IS", "Iceland"),
    Country::new("IN", "India"),
    Country::new("ID", "Indonesia"),
    Country::new("IR", "Iran"),
    Country::new("IQ", "Iraq"),
    Country::new("IE", "Ireland"),
    Country::new("IM", "Isle of Man"),
    Country::new("IL", "Israel"),
    Country::new("IT", "Italy"),
    Country::new("JM", "Jamaica"),
    Country::new("JP", "Japan"),
    Country::new("JE", "Jersey"),
    Country::new("JO", "Jordan"),
    Country::new("KZ", "Kazakhstan"),
    Country::new("KE", "Kenya"),
    Country::new("KI", "Kiribati"),
    Country::new("KP", "Korea, Democratic People's Republic of"),
    Country::new("KR", "Korea, Republic of"),
    Country::new("KW", "Kuwait"),
    Country::new("KG", "Kyrgyzstan"),
    Country::new("LA", "Lao People's Democratic Republic"),
    Country::new("LV", "Latvia"),
    Country::new("LB", "Lebanon"),
    Country::new("LS", "Lesotho"),
    Country::new("LR", "Liberia"),
    Country::new("LY", "Libya"),
    Country::new("LI", "Liechtenstein"),
    Country::new("LT", "Lithuania"),
    Country::new("LU", "Luxembourg"),
    Country::new("MO", "Macao"),
    Country::new("MG", "Madagascar"),
    Country::new("MW", "Malawi"),
    Country::new("MY", "Malaysia"),
    Country::new("MV", "Maldives"),
    Country::new("ML", "Mali"),
    Country::new("MT", "Malta"),
    Country::new("MH", "Marshall Islands"),
    Country::new("MQ", "Martinique"),
    Country::new("MR", "Mauritania"),
    Country::new("MU", "Mauritius"),
    Country::new("YT", "Mayotte"),
    Country::new("MX", "Mexico"),
    Country::new("FM", "Micronesia"),
    Country::new("MD", "Moldova"),
    Country::new("MC", "Monaco"),
    Country::new("MN", "Mongolia"),
    Country::new("ME", "Montenegro"),
    Country::new("MS", "Montserrat"),
    Country::new("MA", "Morocco"),
    Country::new("MZ", "Mozambique"),
    Country::new("MM", "Myanmar"),
    Country::new("NA", "Namibia"),
    Country::new("NR", "Nauru"),
    Country::new("NP", "Nepal"),
    Country::new("NL", "Netherlands"),
    Country::new("NC", "New Caledonia"),
    Country::new("NZ", "New Zealand"),
    Country::new("NI", "Nicaragua"),
    Country::new("NE", "Niger"),
    Country::new("NG", "Nigeria"),
    Country::new("NU", "Niue"),
    Country::new("NF", "Norfolk Island"),
    Country::new("MK", "North Macedonia"),
    Country::new("MP", "Northern Mariana Islands"),
    Country::new("NO", "Norway"),
    Country::new("OM", "Oman"),
    Country::new("PK", "Pakistan"),
    Country::new("PW", "Palau"),
    Country::new("PS", "Palestine, State of"),
    Country::new("PA", "Panama"),
    Country::new("PG", "Papua New Guinea"),
    Country::new("PY", "Paraguay"),
    Country::new("PE", "Peru"),
    Country::new("PH", "Philippines"),
    Country::new("PN", "Pitcairn"),
    Country::new("PL", "Poland"),
    Country::new("PT", "Portugal"),
    Country::new("PR", "Puerto Rico"),
    Country::new("QA", "Qatar"),
    Country::new("RE", "Réunion"),
    Country::new("RO", "Romania"),
    Country::new("RU", "Russian Federation"),
    Country::new("RW", "Rwanda"),
    Country::new("BL", "Saint Barthélemy"),
    Country::new("SH", "Saint Helena, Ascension and Tristan da Cunha"),
    Country::new("KN", "Saint Kitts and Nevis"),
    Country::new("LC", "Saint Lucia"),
    Country::new("MF", "Saint Martin (French part)"),
    Country::new("PM", "Saint Pierre and Miquelon"),
    Country::new("VC", "Saint Vincent and the Grenadines"),
    Country::new("WS", "Samoa"),
    Country::new("SM", "San Marino"),
    Country::new("ST", "Sao Tome and Principe"),
    Country::new("SA", "Saudi Arabia"),
    Country::new("SN", "Senegal"),
    Country::new("RS", "Serbia"),
    Country::new("SC", "Seychelles"),
    Country::new("SL", "Sierra Leone"),
    Country::new("SG", "Singapore"),
    Country::new("SX", "Sint Maarten (Dutch part)"),
    Country::new("SK", "Slovakia"),
    Country::new("SI", "Slovenia"),
    Country::new("SB", "Solomon Islands"),
    Country::new("SO", "Somalia"),
    Country::new("ZA", "South Africa"),
    Country::new("GS", "South Georgia and the South Sandwich Islands"),
    Country::new("SS", "South Sudan"),
    Country::new("ES", "Spain"),
    Country::new("LK", "Sri Lanka"),
    Country::new("SD", "Sudan"),
    Country::new("SR", "Suriname"),
    Country::new("SJ", "Svalbard and Jan Mayen"),
    Country::new("SE", "Sweden"),
    Country::new("CH", "Switzerland"),
    Country::new("SY", "Syrian Arab Republic"),
    Country::new("TW", "Taiwan"),
    Country::new("TJ", "Tajikistan"),
    Country::new("TZ", "Tanzania"),
    Country::new("TH", "Thailand"),
    Country::new("TL", "Timor-Leste"),
    Country::new("TG", "Togo"),
    Country::new("TK", "Tokelau"),
    Country::new("TO", "Tonga"),
    Country::new("TT", "Trinidad and Tobago"),
    Country::new("TN", "Tunisia"),
    Country::new("TR", "Türkiye"),
    Country::new("TM", "Turkmenistan"),
    Country::new("TC", "Turks and Caicos Islands"),
    Country::new("TV", "Tuvalu"),
    Country::new("UG", "Uganda"),
    Country::new("UA", "Ukraine"),
    Country::new("AE", "United Arab Emirates"),
    Country::new("GB", "United Kingdom"),
    Country::new("UM", "United States Minor Outlying Islands"),
    Country::new("US", "United States of America"),
    Country::new("UY", "Uruguay"),
    Country::new("UZ", "Uzbekistan"),
    Country::new("VU", "Vanuatu"),
    Country::new("VE", "Venezuela"),
    Country::new("VN", "Viet Nam"),
    Country::new("VG", "Virgin Islands (British)"),
    Country::new("VI", "Virgin Islands (U.S.)"),
    Country::new("WF", "Wallis and Futuna"),
    Country::new("EH", "Western Sahara"),
    Country::new("YE", "Yemen"),
    Country::new("ZM", "Zambia"),
    Country::new("ZW", "Zimbabwe"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_is_complete_and_unique() {
        let catalog = CountryCatalog::all();
        assert_eq!(catalog.len(), 249);

        let codes: HashSet<_> = catalog.iter().map(|c| c.code).collect();
        assert_eq!(codes.len(), catalog.len());
    }

    #[test]
    fn test_catalog_is_ordered_by_name() {
        let names: Vec<_> = CountryCatalog::all().iter().map(|c| c.name).collect();
        assert_eq!(&names[..4], &["Afghanistan", "Åland Islands", "Albania", "Algeria"]);
        assert_eq!(names.last(), Some(&"Zimbabwe"));

        let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert!(position("Côte d'Ivoire") < position("Croatia"));
        assert!(position("Germany") < position("Ghana"));
    }

    #[test]
    fn test_from_countries_drops_repeats() {
        let de = lookup("DE").unwrap();
        let fr = lookup("FR").unwrap();

        let catalog = CountryCatalog::from_countries(vec![de, fr, de, de]);
        let codes: Vec<_> = catalog.iter().map(|c| c.code).collect();
        assert_eq!(codes, vec!["DE", "FR"]);
    }

    #[test]
    fn test_exit_spec() {
        let de = lookup("de").unwrap();
        assert_eq!(de.exit_spec(), "{de}");
        assert_eq!(de.to_string(), "Germany (DE)");
    }

    #[test]
    fn test_select_keeps_catalog_order() {
        let catalog = CountryCatalog::select(&["us", "DE", "br", "de"]).unwrap();
        let codes: Vec<_> = catalog.iter().map(|c| c.code).collect();
        assert_eq!(codes, vec!["BR", "DE", "US"]);
    }

    #[test]
    fn test_select_rejects_unknown_code() {
        let err = CountryCatalog::select(&["us", "xx"]).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownCode(ref c) if c == "xx"));
    }

    #[test]
    fn test_select_rejects_empty() {
        let err = CountryCatalog::select(&["", " "]).unwrap_err();
        assert!(matches!(err, CatalogError::Empty));
    }
}
