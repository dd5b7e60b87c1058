//! Prompt templates and rendering.
//!
//! Templates carry `{user_history}`, `{user_profiles}` and `{user_profile}`
//! placeholders. Rendering is single-pass, so text substituted into one
//! placeholder is never re-scanned for another.

use regex::{Captures, Regex};
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{ProfileError, Result};
use crate::types::InteractionRecord;

pub const USER_HISTORY: &str = "user_history";
pub const USER_PROFILES: &str = "user_profiles";
pub const USER_PROFILE: &str = "user_profile";

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(user_history|user_profiles|user_profile)\}").expect("invalid regex")
});

/// Names of the known placeholders used by a template, in order of appearance
pub fn placeholders(template: &str) -> Vec<&str> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect()
}

/// Substitute placeholders in one pass; unknown names are left untouched
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |cap: &Captures| {
            let name = &cap[1];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| cap[0].to_string())
        })
        .into_owned()
}

/// Serialize a chunk of records the way every history placeholder expects
pub fn render_history(records: &[InteractionRecord]) -> String {
    // Serializing maps of JSON values cannot fail.
    serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string())
}

/// Serialize a list of partial profiles for an aggregation prompt
pub fn render_profiles(profiles: &[String]) -> String {
    serde_json::to_string(profiles).unwrap_or_else(|_| "[]".to_string())
}

fn require(template: &str, what: &str, names: &[&str]) -> Result<()> {
    let found = placeholders(template);
    for name in names {
        if !found.contains(name) {
            return Err(ProfileError::Template(format!(
                "{} template is missing {{{}}}",
                what, name
            )));
        }
    }
    Ok(())
}

/// Templates for the aggregate-after strategy
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateAfterPrompts {
    pub create_profile: String,
    pub aggregate_profiles: String,
}

impl AggregateAfterPrompts {
    pub fn render_create(&self, records: &[InteractionRecord]) -> String {
        fill(&self.create_profile, &[(USER_HISTORY, &render_history(records))])
    }

    pub fn render_aggregate(&self, profiles: &[String]) -> String {
        fill(&self.aggregate_profiles, &[(USER_PROFILES, &render_profiles(profiles))])
    }

    fn validate(&self) -> Result<()> {
        require(&self.create_profile, "create_profile", &[USER_HISTORY])?;
        require(&self.aggregate_profiles, "aggregate_profiles", &[USER_PROFILES])
    }
}

/// Templates for the aggregate-with-carry strategy
#[derive(Debug, Clone, Deserialize)]
pub struct CarryPrompts {
    pub create_first_profile: String,
    pub update_profile: String,
}

impl CarryPrompts {
    /// An empty carry renders the first-profile template
    pub fn render(&self, records: &[InteractionRecord], carried: &str) -> String {
        let history = render_history(records);
        if carried.is_empty() {
            fill(&self.create_first_profile, &[(USER_HISTORY, &history)])
        } else {
            fill(
                &self.update_profile,
                &[(USER_PROFILE, carried), (USER_HISTORY, &history)],
            )
        }
    }

    fn validate(&self) -> Result<()> {
        require(&self.create_first_profile, "create_first_profile", &[USER_HISTORY])?;
        require(&self.update_profile, "update_profile", &[USER_PROFILE, USER_HISTORY])
    }
}

/// One named aspect template of a multi-aspect set
#[derive(Debug, Clone, Deserialize)]
pub struct AspectTemplate {
    pub name: String,
    pub template: String,
}

/// Templates for the multi-aspect strategy
#[derive(Debug, Clone, Deserialize)]
pub struct AspectPrompts {
    pub aspects: Vec<AspectTemplate>,
    pub aggregate: String,
}

impl AspectPrompts {
    pub fn render_aspect(&self, aspect: &AspectTemplate, records: &[InteractionRecord]) -> String {
        fill(&aspect.template, &[(USER_HISTORY, &render_history(records))])
    }

    pub fn render_aggregate(&self, profiles: &[String]) -> String {
        fill(&self.aggregate, &[(USER_PROFILES, &render_profiles(profiles))])
    }

    fn validate(&self) -> Result<()> {
        if self.aspects.is_empty() {
            return Err(ProfileError::Template("multi_aspect needs at least one aspect".into()));
        }
        for aspect in &self.aspects {
            require(&aspect.template, &aspect.name, &[USER_HISTORY])?;
            if self.aspects.iter().filter(|a| a.name == aspect.name).count() > 1 {
                return Err(ProfileError::Template(format!(
                    "duplicate aspect name '{}'",
                    aspect.name
                )));
            }
        }
        require(&self.aggregate, "aggregate", &[USER_PROFILES])
    }
}

/// Every template needed by the three strategies for one domain
#[derive(Debug, Clone, Deserialize)]
pub struct PromptSet {
    pub aggregate_after: AggregateAfterPrompts,
    pub carry: CarryPrompts,
    pub multi_aspect: AspectPrompts,
}

impl PromptSet {
    /// Built-in template set by domain name (`movies` or `products`)
    pub fn builtin(domain: &str) -> Result<Self> {
        match domain {
            "movies" => Ok(movies()),
            "products" => Ok(products()),
            other => Err(ProfileError::Config(format!(
                "unknown prompt domain '{}' (expected movies or products)",
                other
            ))),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let set: PromptSet = toml::from_str(content)?;
        set.validate()?;
        Ok(set)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.aggregate_after.validate()?;
        self.carry.validate()?;
        self.multi_aspect.validate()
    }
}

const MOVIES_CREATE: &str = "\
You are an analyst who infers viewer interests from the movies they watched. \
Each entry below carries movie metadata and the percent of the movie the user watched.

Write a profile of the user's taste in 5 paragraphs:
1. Preferred release years and production countries.
2. Genres, keywords and plot devices.
3. What the completed movies (more than 80% watched) have in common.
4. What the abandoned movies (less than 50% watched) have in common.
5. A short summary covering all of the above.

Do not name specific movies. The profile is used for further recommendations.

**History of movies watched**:
{user_history}";

const MOVIES_AGGREGATE: &str = "\
You are an analyst who merges several profiles of one viewer. Each profile below \
describes the user's taste over a consecutive period of time.

Write one consistent profile in the same 5-paragraph structure. Resolve \
contradictions, favouring later periods. Do not name specific movies.

**Profiles for consecutive periods**:
{user_profiles}";

const MOVIES_UPDATE: &str = "\
You are an analyst who keeps a viewer profile up to date. Below are the current \
profile and a sequence of newly watched movies with the percent watched.

Rewrite the profile in the same 5-paragraph structure so it reflects both. \
Prefer the newer interactions when they conflict. Do not name specific movies.

**Current profile**:
{user_profile}

**History of movies watched**:
{user_history}";

const MOVIES_NEEDS: &str = "\
Describe the viewer's needs from their history: what they watch for, rewatching \
habits and how they explore new titles.

### User history:
{user_history}";

const MOVIES_GENRES: &str = "\
List the viewer's top genres with a short justification for each.

### User history:
{user_history}";

const MOVIES_STUDIOS: &str = "\
Identify the studios, franchises and directors the viewer prefers and their rough shares.

### User history:
{user_history}";

const PRODUCTS_CREATE: &str = "\
You are an analyst who infers shopper interests from product reviews. Each entry \
below carries the product title, description, category and the user's rating.

Write a profile of the shopper in 5 paragraphs:
1. Preferred product categories and types.
2. Favoured features, ingredients and brands.
3. What highly rated products (4 stars and above) have in common.
4. What poorly rated products (2 stars and below) have in common.
5. A short summary covering all of the above.

Do not name specific products or ratings.

**History of product interactions**:
{user_history}";

const PRODUCTS_AGGREGATE: &str = "\
You are an analyst who merges several profiles of one shopper. Each profile below \
describes the shopper over a consecutive period of time.

Write one consistent profile with the same structure, resolving contradictions.

**Profiles for consecutive periods**:
{user_profiles}";

const PRODUCTS_UPDATE: &str = "\
You are an analyst who keeps a shopper profile up to date. Below are the current \
profile and newly reviewed products.

Rewrite the profile with the same structure so it reflects both, preferring the \
newer interactions when they conflict.

**Current profile**:
{user_profile}

**History of product interactions**:
{user_history}";

const PRODUCTS_NEEDS: &str = "\
Infer the shopper's main needs and goals from their product history.

**History of product interactions**:
{user_history}";

const PRODUCTS_PATTERNS: &str = "\
Describe the shopper's usage routines, purchase frequency and willingness to experiment.

**History of product interactions**:
{user_history}";

const PRODUCTS_BRANDS: &str = "\
Describe the shopper's preferred brands, price range and style.

**History of product interactions**:
{user_history}";

fn aspect(name: &str, template: &str) -> AspectTemplate {
    AspectTemplate { name: name.to_string(), template: template.to_string() }
}

fn movies() -> PromptSet {
    PromptSet {
        aggregate_after: AggregateAfterPrompts {
            create_profile: MOVIES_CREATE.to_string(),
            aggregate_profiles: MOVIES_AGGREGATE.to_string(),
        },
        carry: CarryPrompts {
            create_first_profile: MOVIES_CREATE.to_string(),
            update_profile: MOVIES_UPDATE.to_string(),
        },
        multi_aspect: AspectPrompts {
            aspects: vec![
                aspect("user_needs", MOVIES_NEEDS),
                aspect("user_genres", MOVIES_GENRES),
                aspect("user_studios", MOVIES_STUDIOS),
            ],
            aggregate: MOVIES_AGGREGATE.to_string(),
        },
    }
}

fn products() -> PromptSet {
    PromptSet {
        aggregate_after: AggregateAfterPrompts {
            create_profile: PRODUCTS_CREATE.to_string(),
            aggregate_profiles: PRODUCTS_AGGREGATE.to_string(),
        },
        carry: CarryPrompts {
            create_first_profile: PRODUCTS_CREATE.to_string(),
            update_profile: PRODUCTS_UPDATE.to_string(),
        },
        multi_aspect: AspectPrompts {
            aspects: vec![
                aspect("product_needs", PRODUCTS_NEEDS),
                aspect("product_patterns", PRODUCTS_PATTERNS),
                aspect("product_brands", PRODUCTS_BRANDS),
            ],
            aggregate: PRODUCTS_AGGREGATE.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(title: &str) -> InteractionRecord {
        let mut r = InteractionRecord::new();
        r.insert("title", json!(title));
        r
    }

    #[test]
    fn test_builtin_sets_validate() {
        PromptSet::builtin("movies").unwrap().validate().unwrap();
        PromptSet::builtin("products").unwrap().validate().unwrap();
        assert!(PromptSet::builtin("books").is_err());
    }

    #[test]
    fn test_fill_is_single_pass() {
        let out = fill(
            "P: {user_profile} H: {user_history}",
            &[(USER_PROFILE, "likes {user_history}"), (USER_HISTORY, "[1]")],
        );
        assert_eq!(out, "P: likes {user_history} H: [1]");
    }

    #[test]
    fn test_fill_leaves_other_braces() {
        let out = fill("{\"purpose\": <x>} {user_history}", &[(USER_HISTORY, "[]")]);
        assert_eq!(out, "{\"purpose\": <x>} []");
    }

    #[test]
    fn test_carry_switches_template_on_empty_profile() {
        let prompts = PromptSet::builtin("movies").unwrap().carry;
        let records = vec![record("Heat")];
        let first = prompts.render(&records, "");
        assert!(first.contains(r#"[{"title":"Heat"}]"#));
        assert!(!first.contains("**Current profile**"));

        let update = prompts.render(&records, "Enjoys crime dramas");
        assert!(update.contains("**Current profile**:\nEnjoys crime dramas"));
    }

    #[test]
    fn test_toml_set_requires_placeholders() {
        let toml = r#"
[aggregate_after]
create_profile = "history: {user_history}"
aggregate_profiles = "profiles: {user_profiles}"

[carry]
create_first_profile = "history: {user_history}"
update_profile = "history only: {user_history}"

[multi_aspect]
aggregate = "profiles: {user_profiles}"

[[multi_aspect.aspects]]
name = "genres"
template = "genres: {user_history}"
"#;
        match PromptSet::from_toml_str(toml) {
            Err(ProfileError::Template(msg)) => assert!(msg.contains("user_profile")),
            other => panic!("expected template error, got {:?}", other),
        }

        let fixed = toml.replace("history only: {user_history}", "{user_profile} {user_history}");
        let set = PromptSet::from_toml_str(&fixed).unwrap();
        assert_eq!(set.multi_aspect.aspects[0].name, "genres");
    }
}
