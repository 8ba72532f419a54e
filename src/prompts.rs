//! Prompt templates for person-name annotation.
//!
//! Provider-agnostic; the annotator turns a [`PromptInstance`] into chat messages.

use crate::corpus::strip_tags;
use crate::gateway::Message;
use crate::validate::LabelSet;

/// Rendered prompt ready for the LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }

    /// Total prompt length in characters.
    pub fn len(&self) -> usize {
        self.system.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.user.is_empty()
    }
}

/// A prompt template with `{labels}`, `{examples}` and `{names}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Render with worked `examples` and the `names` to tag.
    ///
    /// Names are stripped of any markup first, so annotated test lines can be
    /// passed directly.
    pub fn render<S: AsRef<str>, T: AsRef<str>>(
        &self,
        labels: &LabelSet,
        examples: &[S],
        names: &[T],
    ) -> PromptInstance {
        let labels = labels.iter().collect::<Vec<_>>().join(", ");
        let examples = examples
            .iter()
            .map(|e| e.as_ref())
            .collect::<Vec<_>>()
            .join("\n");
        let names = names
            .iter()
            .map(|n| strip_tags(n.as_ref()))
            .collect::<Vec<_>>()
            .join("\n");

        PromptInstance {
            template_slug: self.slug,
            system: self.system.replace("{labels}", &labels),
            user: self
                .user
                .replace("{examples}", &examples)
                .replace("{names}", &names),
        }
    }
}

pub const NER_V1: PromptTemplate = PromptTemplate {
    slug: "person_ner_v1",
    system: "You are a Named Entity Recognition (NER) tool that takes person names on input and adds XML \
annotations for the different parts of each name: given name, surname, initials etc. You may only use \
the following entities: {labels}.\n\
Every sequence of one or more non-whitespace characters must be annotated with an entity.",
    user: "Example output:\n\n{examples}\n\n\
Observe that entities can only start and end on whitespace; a comma \",\" can reverse the order of the \
given name and surname; prefixes and suffixes can mark marital status, generation, education, profession \
etc.; initials and nicknames can be used instead of, or in addition to, given names and surnames; \"&\" \
and \"and\" entities can join several names on a single line.\n\n\
Now annotate the following raw names, one output line per input line, in the same order. Do NOT output \
anything else: no description, no line numbers, no bullet points. Do NOT insert extra characters into \
the raw text inside annotations, nor change existing characters. Input names:\n\n{names}",
};

pub const DEFAULT_PROMPT: PromptTemplate = NER_V1;

pub const PROMPTS: &[PromptTemplate] = &[NER_V1];

pub fn prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    PROMPTS.iter().find(|p| p.slug == slug).copied()
}
