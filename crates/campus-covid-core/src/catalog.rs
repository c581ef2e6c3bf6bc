use std::collections::BTreeMap;

use serde::Serialize;
use time::{Date, Month};

use crate::{CollectionId, CovidError};

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct KeyDate {
    #[serde(with = "crate::day_format")]
    pub date: Date,
    pub comment: String,
}

/// Display metadata for one reporting unit.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub color: String,
    pub population: u64,
    pub children: Vec<CollectionId>,
    pub key_dates: Vec<KeyDate>,
}

/// The set of collections an ingestion run accepts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Catalog {
    collections: BTreeMap<CollectionId, Collection>,
}

impl Catalog {
    /// Every collection tracked by the project.
    #[must_use]
    pub fn standard() -> Self {
        use CollectionId as Id;

        let entries = vec![
            entry(
                Id::BostonCollege,
                "Boston College",
                "8a100b",
                0,
                &[Id::BostonCollegeUndergrads, Id::BostonCollegeCommunity],
                &[((2020, Month::August, 31), "Classes begin")],
            ),
            entry(
                Id::BostonCollegeUndergrads,
                "Boston College Undergraduates",
                "8a100b",
                7_496,
                &[],
                &[
                    ((2020, Month::August, 17), "Early move in begins"),
                    (
                        (2020, Month::August, 28),
                        "Most undergraduate students begin to move in",
                    ),
                ],
            ),
            entry(
                Id::BostonCollegeCommunity,
                "Boston College Community",
                "8a100b",
                7_673,
                &[],
                &[],
            ),
            entry(
                Id::BabsonCollege,
                "Babson College",
                "006644",
                0,
                &[],
                &[((2020, Month::August, 24), "Classes begin")],
            ),
            entry(
                Id::BentleyUniversity,
                "Bentley University",
                "0075be",
                0,
                &[],
                &[((2020, Month::August, 31), "Classes begin")],
            ),
            entry(
                Id::BrandeisUniversity,
                "Brandeis University",
                "003478",
                0,
                &[],
                &[((2020, Month::August, 26), "Classes begin")],
            ),
            entry(
                Id::BostonUniversity,
                "Boston University",
                "cc0000",
                36_085,
                &[],
                &[((2020, Month::September, 9), "Classes begin")],
            ),
            entry(
                Id::HarvardUniversity,
                "Harvard University",
                "a51c30",
                0,
                &[
                    Id::HarvardUniversityUndergrad,
                    Id::HarvardUniversityGrad,
                    Id::HarvardUniversityOther,
                ],
                &[((2020, Month::September, 2), "Classes begin")],
            ),
            entry(
                Id::HarvardUniversityUndergrad,
                "Harvard University Undergraduates",
                "a51c30",
                0,
                &[],
                &[],
            ),
            entry(
                Id::HarvardUniversityGrad,
                "Harvard University Graduate Students",
                "a51c30",
                0,
                &[],
                &[],
            ),
            entry(
                Id::HarvardUniversityOther,
                "Harvard University Faculty, Staff, or Other Affiliates",
                "a51c30",
                0,
                &[],
                &[],
            ),
            entry(
                Id::MassachusettsInstituteOfTechnology,
                "Massachusetts Institute of Technology",
                "a31f34",
                0,
                &[],
                &[((2020, Month::September, 1), "Classes begin")],
            ),
            entry(
                Id::NortheasternUniversity,
                "Northeastern University",
                "d41b2c",
                42_708,
                &[],
                &[((2020, Month::September, 2), "Classes begin")],
            ),
            entry(
                Id::TuftsUniversity,
                "Tufts University",
                "3e8ede",
                0,
                &[],
                &[((2020, Month::September, 8), "Classes begin")],
            ),
            entry(
                Id::UmassAmherst,
                "UMass Amherst",
                "881c1c",
                0,
                &[],
                &[((2020, Month::August, 24), "Classes begin")],
            ),
            entry(
                Id::WellesleyCollege,
                "Wellesley College",
                "002776",
                0,
                &[],
                &[((2020, Month::August, 31), "Classes begin")],
            ),
            entry(
                Id::Massachusetts,
                "Massachusetts",
                "14558f",
                6_892_503,
                &[],
                &[],
            ),
        ];

        Self {
            collections: entries
                .into_iter()
                .map(|collection| (collection.id, collection))
                .collect(),
        }
    }

    /// Restricts the standard catalog to `ids`.
    ///
    /// Children outside the restricted set are dropped from each parent so
    /// the result stays self-consistent.
    #[must_use]
    pub fn restricted(ids: &[CollectionId]) -> Self {
        let mut collections: BTreeMap<CollectionId, Collection> = Self::standard()
            .collections
            .into_iter()
            .filter(|(id, _)| ids.contains(id))
            .collect();

        for collection in collections.values_mut() {
            collection.children.retain(|child| ids.contains(child));
        }

        Self { collections }
    }

    #[must_use]
    pub fn get(&self, id: CollectionId) -> Option<&Collection> {
        self.collections.get(&id)
    }

    /// Looks up `id`, rejecting identifiers this catalog does not carry.
    ///
    /// # Errors
    /// Returns [`CovidError::UnknownCollection`] when `id` is absent.
    pub fn require(&self, id: CollectionId) -> Result<&Collection, CovidError> {
        self.get(id)
            .ok_or_else(|| CovidError::UnknownCollection(id.as_str().to_string()))
    }

    #[must_use]
    pub fn contains(&self, id: CollectionId) -> bool {
        self.collections.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    #[must_use]
    pub fn parent_of(&self, id: CollectionId) -> Option<CollectionId> {
        self.collections
            .values()
            .find(|collection| collection.children.contains(&id))
            .map(|collection| collection.id)
    }
}

fn entry(
    id: CollectionId,
    name: &str,
    color: &str,
    population: u64,
    children: &[CollectionId],
    key_dates: &[((i32, Month, u8), &str)],
) -> Collection {
    Collection {
        id,
        name: name.to_string(),
        color: color.to_string(),
        population,
        children: children.to_vec(),
        key_dates: key_dates
            .iter()
            .filter_map(|((year, month, day), comment)| {
                Date::from_calendar_date(*year, *month, *day)
                    .ok()
                    .map(|date| KeyDate {
                        date,
                        comment: (*comment).to_string(),
                    })
            })
            .collect(),
    }
}
