// 🗺️ Brazilian federative units - canonical codes + name normalization
//
// Problem solved:
// - "SP", "sp", "São Paulo", "Sao Paulo" → all the same state
// - Stored form is always the 2-letter UF code

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BrazilianState {
    Acre,
    Alagoas,
    Amapa,
    Amazonas,
    Bahia,
    Ceara,
    DistritoFederal,
    EspiritoSanto,
    Goias,
    Maranhao,
    MatoGrosso,
    MatoGrossoDoSul,
    MinasGerais,
    Para,
    Paraiba,
    Parana,
    Pernambuco,
    Piaui,
    RioDeJaneiro,
    RioGrandeDoNorte,
    RioGrandeDoSul,
    Rondonia,
    Roraima,
    SantaCatarina,
    SaoPaulo,
    Sergipe,
    Tocantins,
}

impl BrazilianState {
    pub const ALL: [BrazilianState; 27] = [
        BrazilianState::Acre,
        BrazilianState::Alagoas,
        BrazilianState::Amapa,
        BrazilianState::Amazonas,
        BrazilianState::Bahia,
        BrazilianState::Ceara,
        BrazilianState::DistritoFederal,
        BrazilianState::EspiritoSanto,
        BrazilianState::Goias,
        BrazilianState::Maranhao,
        BrazilianState::MatoGrosso,
        BrazilianState::MatoGrossoDoSul,
        BrazilianState::MinasGerais,
        BrazilianState::Para,
        BrazilianState::Paraiba,
        BrazilianState::Parana,
        BrazilianState::Pernambuco,
        BrazilianState::Piaui,
        BrazilianState::RioDeJaneiro,
        BrazilianState::RioGrandeDoNorte,
        BrazilianState::RioGrandeDoSul,
        BrazilianState::Rondonia,
        BrazilianState::Roraima,
        BrazilianState::SantaCatarina,
        BrazilianState::SaoPaulo,
        BrazilianState::Sergipe,
        BrazilianState::Tocantins,
    ];

    /// Two-letter code (UF)
    pub fn uf(&self) -> &'static str {
        match self {
            BrazilianState::Acre => "AC",
            BrazilianState::Alagoas => "AL",
            BrazilianState::Amapa => "AP",
            BrazilianState::Amazonas => "AM",
            BrazilianState::Bahia => "BA",
            BrazilianState::Ceara => "CE",
            BrazilianState::DistritoFederal => "DF",
            BrazilianState::EspiritoSanto => "ES",
            BrazilianState::Goias => "GO",
            BrazilianState::Maranhao => "MA",
            BrazilianState::MatoGrosso => "MT",
            BrazilianState::MatoGrossoDoSul => "MS",
            BrazilianState::MinasGerais => "MG",
            BrazilianState::Para => "PA",
            BrazilianState::Paraiba => "PB",
            BrazilianState::Parana => "PR",
            BrazilianState::Pernambuco => "PE",
            BrazilianState::Piaui => "PI",
            BrazilianState::RioDeJaneiro => "RJ",
            BrazilianState::RioGrandeDoNorte => "RN",
            BrazilianState::RioGrandeDoSul => "RS",
            BrazilianState::Rondonia => "RO",
            BrazilianState::Roraima => "RR",
            BrazilianState::SantaCatarina => "SC",
            BrazilianState::SaoPaulo => "SP",
            BrazilianState::Sergipe => "SE",
            BrazilianState::Tocantins => "TO",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BrazilianState::Acre => "Acre",
            BrazilianState::Alagoas => "Alagoas",
            BrazilianState::Amapa => "Amapá",
            BrazilianState::Amazonas => "Amazonas",
            BrazilianState::Bahia => "Bahia",
            BrazilianState::Ceara => "Ceará",
            BrazilianState::DistritoFederal => "Distrito Federal",
            BrazilianState::EspiritoSanto => "Espírito Santo",
            BrazilianState::Goias => "Goiás",
            BrazilianState::Maranhao => "Maranhão",
            BrazilianState::MatoGrosso => "Mato Grosso",
            BrazilianState::MatoGrossoDoSul => "Mato Grosso do Sul",
            BrazilianState::MinasGerais => "Minas Gerais",
            BrazilianState::Para => "Pará",
            BrazilianState::Paraiba => "Paraíba",
            BrazilianState::Parana => "Paraná",
            BrazilianState::Pernambuco => "Pernambuco",
            BrazilianState::Piaui => "Piauí",
            BrazilianState::RioDeJaneiro => "Rio de Janeiro",
            BrazilianState::RioGrandeDoNorte => "Rio Grande do Norte",
            BrazilianState::RioGrandeDoSul => "Rio Grande do Sul",
            BrazilianState::Rondonia => "Rondônia",
            BrazilianState::Roraima => "Roraima",
            BrazilianState::SantaCatarina => "Santa Catarina",
            BrazilianState::SaoPaulo => "São Paulo",
            BrazilianState::Sergipe => "Sergipe",
            BrazilianState::Tocantins => "Tocantins",
        }
    }

    /// Case-insensitive UF lookup ("sp" → São Paulo)
    pub fn from_uf(code: &str) -> Option<BrazilianState> {
        let code = code.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.uf().eq_ignore_ascii_case(code))
    }

    /// Full-name lookup, ignoring case and accents
    pub fn from_name(name: &str) -> Option<BrazilianState> {
        let wanted = fold(name);
        if wanted.is_empty() {
            return None;
        }
        Self::ALL
            .iter()
            .copied()
            .find(|state| fold(state.name()) == wanted)
    }

    /// UF first, then full name
    pub fn resolve(token: &str) -> Option<BrazilianState> {
        Self::from_uf(token).or_else(|| Self::from_name(token))
    }
}

impl std::fmt::Display for BrazilianState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.uf())
    }
}

impl TryFrom<String> for BrazilianState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BrazilianState::from_uf(&value).ok_or_else(|| format!("unknown state code: {}", value))
    }
}

impl From<BrazilianState> for String {
    fn from(state: BrazilianState) -> Self {
        state.uf().to_string()
    }
}

/// Lowercase, strip Portuguese diacritics, collapse whitespace
fn fold(value: &str) -> String {
    let folded: String = value
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_27_units() {
        assert_eq!(BrazilianState::ALL.len(), 27);

        let mut codes: Vec<&str> = BrazilianState::ALL.iter().map(|s| s.uf()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 27, "UF codes must be unique");
    }

    #[test]
    fn test_from_uf_is_case_insensitive() {
        assert_eq!(BrazilianState::from_uf("SP"), Some(BrazilianState::SaoPaulo));
        assert_eq!(BrazilianState::from_uf("rj"), Some(BrazilianState::RioDeJaneiro));
        assert_eq!(BrazilianState::from_uf(" df "), Some(BrazilianState::DistritoFederal));
        assert_eq!(BrazilianState::from_uf("XX"), None);
    }

    #[test]
    fn test_from_name_ignores_accents() {
        assert_eq!(BrazilianState::from_name("São Paulo"), Some(BrazilianState::SaoPaulo));
        assert_eq!(BrazilianState::from_name("sao  paulo"), Some(BrazilianState::SaoPaulo));
        assert_eq!(
            BrazilianState::from_name("MATO GROSSO DO SUL"),
            Some(BrazilianState::MatoGrossoDoSul)
        );
        assert_eq!(BrazilianState::from_name("Atlantis"), None);
        assert_eq!(BrazilianState::from_name(""), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(BrazilianState::SaoPaulo.name(), "São Paulo");
        assert_eq!(BrazilianState::MinasGerais.name(), "Minas Gerais");
        assert_eq!(BrazilianState::Bahia.to_string(), "BA");
    }

    #[test]
    fn test_serde_uses_uf_code() {
        let json = serde_json::to_string(&BrazilianState::SaoPaulo).unwrap();
        assert_eq!(json, "\"SP\"");

        let back: BrazilianState = serde_json::from_str("\"mg\"").unwrap();
        assert_eq!(back, BrazilianState::MinasGerais);

        assert!(serde_json::from_str::<BrazilianState>("\"ZZ\"").is_err());
    }
}
