//! Prompt construction for the classification call.
//!
//! The prompt is in Catalan, matching the language of the fed episodes,
//! and demands a raw-JSON reply so the tolerant extractor in the parent
//! module rarely has work to do.

/// Build the classification prompt for one episode.
///
/// The existing category vocabulary is embedded to bias the model toward
/// reusing known names instead of inventing near-duplicates.
pub fn classification_prompt(title: &str, description: &str, existing: &[String]) -> String {
    let vocabulary = if existing.is_empty() {
        "(encara no hi ha categories)".to_string()
    } else {
        existing.join(", ")
    };

    format!(
        r#"# ROL
Actua com un expert historiador i analista de dades.

# TASCA
A partir del títol i la descripció proporcionats, extreu, classifica i estructura la informació històrica PRINCIPAL. Centra't en el títol primer per saber què és allò principal i exclou tot allò que sigui secundari de la descripció. Ignora qualsevol menció a convidats o experts del programa de ràdio i centra't exclusivament en el contingut històric.

# TITOL
{title}

# DESCRIPCIÓ
{description}

# CATEGORIES EXISTENTS
Fes servir aquests noms quan el contingut hi coincideixi, en lloc d'inventar-ne variants:
{vocabulary}

# FORMAT DE SORTIDA
Proporciona la teva resposta exclusivament en format JSON RAW, sense cap formatació markdown ni blocs de codi.
Segueix aquesta estructura exacta:
{{
    "tematica": ["tematica 1", "tematica 2"],
    "epoca": ["epoca 1", "epoca 2"],
    "personatges_rellevants": ["personatge 1", "personatge 2"],
    "llocs_rellevants": ["lloc 1", "lloc 2"]
}}

# INSTRUCCIONS ADDICIONALS
- Extreu la informació PRINCIPAL. Fes servir el text del títol per veure què és allò més important.
- L'època hauria de ser el màxim de concreta possible. Si és una època prou coneguda, no cal que especifiquis els anys o segle.
- Si no s'esmenta cap personatge, època o lloc rellevant, el camp corresponent ha de ser una llista buida.
- Pels llocs i personatges, ignora qualsevol referència a convidats o experts del programa de ràdio; només allò rellevant al fet històric.
"#
    )
}
