use tally_catalog::PolicyCatalog;
use tally_types::{history_text, Route, Turn};

pub fn route_prompt(turn: &Turn, history: &[String]) -> (String, String) {
    let system = "You classify analytics questions by complexity. \
        fast_path: a single lookup, ranking or breakdown answerable with one or two queries. \
        deep_path: comparisons, drivers, root-cause or multi-part analysis. \
        Return strict JSON only."
        .to_string();
    let user = format!(
        "Conversation history:\n{}\n\nQuestion: {}\n\n\
         Return JSON: {{\"route\": \"fast_path\" | \"deep_path\", \"confidence\": number between 0 and 1, \"reason\": short string}}",
        history_text(history),
        turn.message
    );
    (system, user)
}

pub fn plan_prompt(
    turn: &Turn,
    route: Route,
    max_steps: usize,
    catalog: &PolicyCatalog,
    history: &[String],
) -> (String, String) {
    let system = "You plan governed analytics work. Break the question into the minimum number \
        of independent analytical steps, each answerable by one read-only SQL query over the catalog. \
        Do not write SQL. Do not add metrics, breakdowns or comparisons the user did not ask for. \
        Return strict JSON only."
        .to_string();
    let user = format!(
        "Conversation history:\n{}\n\n{}\n\
         Route: {}\nMax steps: {max_steps}\nExplicit filters:\n{}\nQuestion: {}\n\n\
         Return JSON: {{\"steps\": [{{\"goal\": string, \"expectedOutput\": string, \"dependsOn\": [step ids]}}]}}\n\
         Rules:\n\
         - If one step answers the question, return exactly one step.\n\
         - Never exceed Max steps.\n\
         - Keep the user's wording for simple metric requests.",
        history_text(history),
        catalog.summary(),
        route.as_str(),
        turn.filters_text(),
        turn.message
    );
    (system, user)
}
